//! SSDP NOTIFY listener.
//!
//! Bambu printers announce themselves on the LAN with SSDP NOTIFY datagrams
//! sent to 239.255.255.250 on ports 1990 and 2021. The `USN` header carries
//! the device serial (`dev_id`) and `Location` carries its IP address; the
//! vendor headers (`DevName.bambu.com`, `DevModel.bambu.com`, ...) add a few
//! identity hints.

use crate::registry::LocalDeviceReport;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// SSDP multicast group.
pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// Notification type advertised by Bambu printers.
const BAMBU_NT_PREFIX: &str = "urn:bambulab-com:device:3dprinter";

/// One parsed SSDP datagram.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SsdpMessage {
    /// Address the datagram came from, when known.
    pub source: Option<SocketAddr>,
    pub host: String,
    pub server: String,
    pub location: String,
    pub nt: String,
    pub usn: String,
    pub cache_control: String,
    /// Every header not listed above, in arrival order.
    pub custom_fields: Vec<(String, String)>,
}

impl std::fmt::Display for SsdpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SSDP {} at {} (nt: {}, server: {})",
            self.usn, self.location, self.nt, self.server
        )
    }
}

impl SsdpMessage {
    /// Parse a NOTIFY (or M-SEARCH response) payload. Malformed header lines
    /// are skipped rather than failing the whole message.
    pub fn parse(payload: &str) -> Self {
        let mut message = SsdpMessage::default();

        for line in payload.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("notify ") || lower.starts_with("m-search ") || lower.starts_with("http/") {
                continue;
            }

            let Some((header, value)) = line.split_once(':') else {
                tracing::trace!("Skipping malformed SSDP line: {}", line);
                continue;
            };
            let header = header.trim();
            let value = value.trim().to_string();

            match header.to_ascii_lowercase().as_str() {
                "host" => message.host = value,
                "server" => message.server = value,
                "location" => message.location = value,
                "nt" | "st" => message.nt = value,
                "usn" => message.usn = value,
                "cache-control" => message.cache_control = value,
                _ => message.custom_fields.push((header.to_string(), value)),
            }
        }

        message
    }

    /// Look up a non-standard header, ignoring case.
    pub fn custom(&self, name: &str) -> Option<&str> {
        self.custom_fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this announcement comes from a Bambu printer.
    pub fn is_bambu_printer(&self) -> bool {
        !self.usn.is_empty()
            && (self.nt.is_empty() || self.nt.to_ascii_lowercase().starts_with(BAMBU_NT_PREFIX))
    }

    /// IP address of the announcing device: `Location` when it holds one,
    /// otherwise the datagram's source address.
    pub fn device_ip(&self) -> Option<String> {
        let location = self
            .location
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        let host = location.split('/').next().unwrap_or_default();
        let host = match host.rsplit_once(':') {
            Some((addr, port)) if port.chars().all(|c| c.is_ascii_digit()) => addr,
            _ => host,
        };

        if !host.is_empty() {
            return Some(host.to_string());
        }
        self.source.map(|addr| addr.ip().to_string())
    }

    pub fn to_report(&self, seen_at: DateTime<Utc>) -> Option<LocalDeviceReport> {
        if !self.is_bambu_printer() {
            return None;
        }
        Some(LocalDeviceReport {
            dev_id: self.usn.clone(),
            ip: self.device_ip()?,
            online: true,
            print_status: None,
            name: self.custom("DevName.bambu.com").map(str::to_string),
            dev_model_name: self.custom("DevModel.bambu.com").map(str::to_string),
            dev_product_name: None,
            seen_at,
        })
    }
}

/// Listens on one UDP port for SSDP traffic.
pub struct SsdpListener {
    port: u16,
}

impl SsdpListener {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Collect every datagram received on the port during `window`.
    pub async fn listen(&self, window: Duration) -> Result<Vec<SsdpMessage>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .with_context(|| format!("Failed to bind SSDP port {}", self.port))?;

        if let Err(e) = socket.join_multicast_v4(SSDP_MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED) {
            // Unicast and broadcast announcements still arrive.
            tracing::warn!(
                "Could not join SSDP multicast group on port {}: {}",
                self.port,
                e
            );
        }

        tracing::debug!("Listening for SSDP on port {} for {:?}", self.port, window);

        let deadline = Instant::now() + window;
        let mut buf = [0u8; 2048];
        let mut messages = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Ok((size, source))) => {
                    let payload = String::from_utf8_lossy(&buf[..size]);
                    let mut message = SsdpMessage::parse(&payload);
                    message.source = Some(source);
                    messages.push(message);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Error receiving SSDP datagram on port {}: {}", self.port, e);
                    break;
                }
            }
        }

        Ok(messages)
    }
}

/// Keep the most recent announcement per device serial.
pub fn dedupe_by_usn(messages: Vec<SsdpMessage>) -> Vec<SsdpMessage> {
    let mut unique: Vec<SsdpMessage> = Vec::new();
    for message in messages {
        match unique.iter_mut().find(|m| m.usn == message.usn) {
            Some(existing) => *existing = message,
            None => unique.push(message),
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFY: &str = "NOTIFY * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1990\r\n\
        Server: UPnP/1.0\r\n\
        Location: 192.168.1.120\r\n\
        NT: urn:bambulab-com:device:3dprinter:1\r\n\
        USN: 01S00A000000001\r\n\
        Cache-Control: max-age=1800\r\n\
        DevModel.bambu.com: C11\r\n\
        DevName.bambu.com: Garage P1P\r\n\
        DevConnect.bambu.com: lan\r\n\
        DevBind.bambu.com: occupied\r\n\r\n";

    #[test]
    fn test_parse_bambu_notify() {
        let message = SsdpMessage::parse(NOTIFY);
        assert_eq!(message.host, "239.255.255.250:1990");
        assert_eq!(message.location, "192.168.1.120");
        assert_eq!(message.usn, "01S00A000000001");
        assert_eq!(message.cache_control, "max-age=1800");
        assert_eq!(message.custom("devname.bambu.com"), Some("Garage P1P"));
        assert!(message.is_bambu_printer());
    }

    #[test]
    fn test_report_from_notify() {
        let seen_at = Utc::now();
        let report = SsdpMessage::parse(NOTIFY).to_report(seen_at).unwrap();
        assert_eq!(report.dev_id, "01S00A000000001");
        assert_eq!(report.ip, "192.168.1.120");
        assert!(report.online);
        assert_eq!(report.name.as_deref(), Some("Garage P1P"));
        assert_eq!(report.dev_model_name.as_deref(), Some("C11"));
        assert_eq!(report.seen_at, seen_at);
    }

    #[test]
    fn test_other_upnp_devices_are_ignored() {
        let payload = "NOTIFY * HTTP/1.1\r\n\
            HOST: 239.255.255.250:1900\r\n\
            LOCATION: http://192.168.1.1:49152/rootDesc.xml\r\n\
            NT: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
            USN: uuid:router::upnp:rootdevice\r\n\r\n";
        let message = SsdpMessage::parse(payload);
        assert!(!message.is_bambu_printer());
        assert!(message.to_report(Utc::now()).is_none());
        assert_eq!(message.device_ip().as_deref(), Some("192.168.1.1"));
    }

    #[test]
    fn test_ip_falls_back_to_source_address() {
        let mut message = SsdpMessage::parse("USN: X1\r\nNT: urn:bambulab-com:device:3dprinter:1\r\n");
        assert_eq!(message.device_ip(), None);
        message.source = Some("10.0.0.42:2021".parse().unwrap());
        assert_eq!(message.device_ip().as_deref(), Some("10.0.0.42"));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let message = SsdpMessage::parse("NOTIFY * HTTP/1.1\r\ngarbage line\r\nUSN: X1\r\n");
        assert_eq!(message.usn, "X1");
        assert!(message.custom_fields.is_empty());
    }

    #[test]
    fn test_dedupe_keeps_latest() {
        let mut first = SsdpMessage::parse(NOTIFY);
        first.location = "192.168.1.100".to_string();
        let second = SsdpMessage::parse(NOTIFY);
        let unique = dedupe_by_usn(vec![first, second]);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].location, "192.168.1.120");
    }

    #[tokio::test]
    async fn test_listener_receives_unicast_notify() {
        let port = {
            let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let listener = SsdpListener::new(port);
        let listening = tokio::spawn(async move { listener.listen(Duration::from_millis(300)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(NOTIFY.as_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();

        let messages = listening.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].usn, "01S00A000000001");
        assert!(messages[0].source.is_some());
    }
}
