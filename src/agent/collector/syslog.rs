use super::{generate_entry_id, Collector, CollectorCore, CollectorError, CollectorStats};
use crate::config::types::SyslogProtocol;
use crate::model::{LogEntry, LogLevel};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use regex::Regex;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RFC3164_PATTERN: &str = r"^<(\d+)>(\w+\s+\d+\s+\d+:\d+:\d+)\s+(\S+)\s+(.+)$";

#[derive(Debug, Clone)]
pub struct SyslogCollectorConfig {
    pub address: String,
    pub protocol: SyslogProtocol,
    pub source: String,
    pub host: String,
}

/// Listens for RFC3164 syslog messages over UDP or TCP. Datagrams that
/// do not parse still become entries with the payload as raw.
pub struct SyslogCollector {
    core: Arc<CollectorCore>,
    config: SyslogCollectorConfig,
    pattern: Regex,
    output_rx: Option<mpsc::Receiver<LogEntry>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyslogCollector {
    pub fn new(name: String, config: SyslogCollectorConfig) -> Self {
        let (core, output_rx) = CollectorCore::new(name, "syslog", 1000);
        let (stop_tx, _) = watch::channel(false);
        Self {
            core,
            config,
            pattern: Regex::new(RFC3164_PATTERN).unwrap(),
            output_rx: Some(output_rx),
            stop_tx,
            task: None,
        }
    }

    fn parse_message(
        pattern: &Regex,
        source: &str,
        host: &str,
        message: &str,
    ) -> LogEntry {
        let mut entry = LogEntry::new();
        entry.id = generate_entry_id(source, message);
        entry.raw = message.to_string();
        entry.source = source.to_string();
        entry.host = host.to_string();
        entry.timestamp = Utc::now();

        if let Some(captures) = pattern.captures(message) {
            let priority: u16 = captures[1].parse().unwrap_or(13);
            entry.level = priority_to_level(priority);

            if let Some(ts) = parse_rfc3164_timestamp(&captures[2]) {
                entry.timestamp = ts;
            }
            entry.add_field("syslog_host", captures[3].to_string());
            entry.message = captures[4].to_string();
        } else {
            entry.message = message.to_string();
            entry.level = LogLevel::Info;
        }

        entry
    }
}

/// RFC3164 severity is the low three bits of the priority value.
fn priority_to_level(priority: u16) -> LogLevel {
    match priority & 0x07 {
        0..=2 => LogLevel::Fatal,
        3 => LogLevel::Error,
        4 => LogLevel::Warn,
        5 | 6 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

/// Parses the year-less RFC3164 timestamp ("Jan  2 15:04:05"), assuming
/// the current year.
fn parse_rfc3164_timestamp(value: &str) -> Option<chrono::DateTime<Utc>> {
    let with_year = format!("{} {}", Utc::now().year(), value);
    NaiveDate::parse_from_str(&with_year.split_whitespace().take(3).collect::<Vec<_>>().join(" "), "%Y %b %d")
        .ok()
        .and_then(|date| {
            let time_part = value.split_whitespace().nth(2)?;
            let time = chrono::NaiveTime::parse_from_str(time_part, "%H:%M:%S").ok()?;
            Utc.from_local_datetime(&date.and_time(time)).single()
        })
}

#[async_trait]
impl Collector for SyslogCollector {
    async fn start(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), CollectorError> {
        if self.task.is_some() {
            return Err(CollectorError::AlreadyStarted);
        }

        let core = Arc::clone(&self.core);
        let pattern = self.pattern.clone();
        let source = self.config.source.clone();
        let host = self.config.host.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let mut shutdown = shutdown;

        match self.config.protocol {
            SyslogProtocol::Udp => {
                let socket = UdpSocket::bind(&self.config.address).await?;
                info!(addr = %self.config.address, "syslog collector listening on UDP");

                self.task = Some(tokio::spawn(async move {
                    let mut buf = vec![0u8; 65536];
                    loop {
                        tokio::select! {
                            received = socket.recv_from(&mut buf) => {
                                match received {
                                    Ok((len, _peer)) => {
                                        let message = String::from_utf8_lossy(&buf[..len]);
                                        let entry = SyslogCollector::parse_message(
                                            &pattern, &source, &host, message.trim_end(),
                                        );
                                        core.emit(entry);
                                    }
                                    Err(e) => {
                                        core.record_error(&e);
                                        warn!(error = %e, "syslog UDP receive error");
                                    }
                                }
                            }
                            _ = stop_rx.changed() => break,
                            _ = shutdown.changed() => break,
                        }
                    }
                }));
            }
            SyslogProtocol::Tcp => {
                let listener = TcpListener::bind(&self.config.address).await?;
                info!(addr = %self.config.address, "syslog collector listening on TCP");

                self.task = Some(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            accepted = listener.accept() => {
                                match accepted {
                                    Ok((stream, peer)) => {
                                        debug!(peer = %peer, "syslog TCP connection");
                                        let core = Arc::clone(&core);
                                        let pattern = pattern.clone();
                                        let source = source.clone();
                                        let host = host.clone();
                                        let mut conn_stop = stop_rx.clone();
                                        tokio::spawn(async move {
                                            let reader = tokio::io::BufReader::new(stream);
                                            let mut lines = reader.lines();
                                            loop {
                                                tokio::select! {
                                                    line = lines.next_line() => {
                                                        match line {
                                                            Ok(Some(line)) => {
                                                                let entry = SyslogCollector::parse_message(
                                                                    &pattern, &source, &host, &line,
                                                                );
                                                                core.emit(entry);
                                                            }
                                                            Ok(None) => break,
                                                            Err(e) => {
                                                                core.record_error(&e);
                                                                break;
                                                            }
                                                        }
                                                    }
                                                    _ = conn_stop.changed() => break,
                                                }
                                            }
                                        });
                                    }
                                    Err(e) => {
                                        core.record_error(&e);
                                        warn!(error = %e, "syslog TCP accept error");
                                    }
                                }
                            }
                            _ = stop_rx.changed() => break,
                            _ = shutdown.changed() => break,
                        }
                    }
                }));
            }
        }

        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CollectorError> {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<LogEntry>> {
        self.output_rx.take()
    }

    fn name(&self) -> &str {
        &self.config.source
    }

    fn kind(&self) -> &'static str {
        "syslog"
    }

    fn stats(&self) -> CollectorStats {
        self.core.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(message: &str) -> LogEntry {
        let pattern = Regex::new(RFC3164_PATTERN).unwrap();
        SyslogCollector::parse_message(&pattern, "syslog", "host-1", message)
    }

    #[test]
    fn test_parses_rfc3164() {
        let entry = parse("<34>Oct 11 22:14:15 mymachine su: 'su root' failed on /dev/pts/8");

        // Priority 34 = facility 4, severity 2 (critical).
        assert_eq!(entry.level, LogLevel::Fatal);
        assert_eq!(entry.message, "su: 'su root' failed on /dev/pts/8");
        assert_eq!(
            entry.get_field("syslog_host").unwrap(),
            &serde_json::json!("mymachine")
        );
        assert_eq!(entry.timestamp.month(), 10);
        assert_eq!(entry.timestamp.day(), 11);
        use chrono::Timelike;
        assert_eq!(entry.timestamp.hour(), 22);
    }

    #[test]
    fn test_severity_mapping() {
        // Severity is priority & 7; facility 16 gives priority 128 + sev.
        assert_eq!(parse("<128>Jan  1 00:00:00 h m").level, LogLevel::Fatal);
        assert_eq!(parse("<131>Jan  1 00:00:00 h m").level, LogLevel::Error);
        assert_eq!(parse("<132>Jan  1 00:00:00 h m").level, LogLevel::Warn);
        assert_eq!(parse("<134>Jan  1 00:00:00 h m").level, LogLevel::Info);
        assert_eq!(parse("<135>Jan  1 00:00:00 h m").level, LogLevel::Debug);
    }

    #[test]
    fn test_unparseable_payload_becomes_raw_entry() {
        let entry = parse("not syslog at all");
        assert_eq!(entry.message, "not syslog at all");
        assert_eq!(entry.raw, "not syslog at all");
        assert_eq!(entry.level, LogLevel::Info);
        assert!(entry.get_field("syslog_host").is_none());
    }

    #[tokio::test]
    async fn test_udp_end_to_end() {
        let mut collector = SyslogCollector::new(
            "net".to_string(),
            SyslogCollectorConfig {
                address: "127.0.0.1:0".to_string(),
                protocol: SyslogProtocol::Udp,
                source: "net".to_string(),
                host: "host-1".to_string(),
            },
        );

        // Bind on an ephemeral port and find it through a probe socket.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        collector.config.address = addr.to_string();

        let mut output = collector.take_output().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        collector.start(shutdown_rx).await.unwrap();

        probe
            .send_to(b"<13>Feb  5 17:32:18 box a message", addr)
            .await
            .unwrap();

        let entry = tokio::time::timeout(std::time::Duration::from_secs(5), output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.message, "a message");
        assert_eq!(entry.level, LogLevel::Info);

        collector.stop().await.unwrap();
    }
}
