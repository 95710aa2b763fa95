// MIT License - Copyright (c) 2026 pico-sync contributors
// Serial port transport

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::config::BoardConfig;
use crate::error::{BoardError, Result};
use crate::transport::{Transport, TransportEvent, TransportEventSender, TransportEvents, TransportKind};

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const UNKNOWN_MANUFACTURER: &str = "Unknown manufacturer";

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// A serial port opened by name.
///
/// `serialport` is blocking, so reads run on a dedicated thread and writes
/// go through `spawn_blocking`.
pub struct SerialTransport {
    name: String,
    port: SharedPort,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

impl SerialTransport {
    pub async fn open(name: &str, config: &BoardConfig) -> Result<(Self, TransportEvents)> {
        let path = name.to_string();
        let baud_rate = config.baud_rate;

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(path, baud_rate).timeout(READ_TIMEOUT).open()
        })
        .await
        .map_err(|e| BoardError::Io(std::io::Error::other(e)))?
        .map_err(|e| {
            error!("Failed to open serial port {}: {}", name, e);
            BoardError::SerialPort(e)
        })?;

        let reader = port.try_clone()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));

        spawn_reader_thread(reader, tx, stop.clone(), connected.clone());

        let transport = Self {
            name: name.to_string(),
            port: Arc::new(Mutex::new(Some(port))),
            stop,
            connected,
        };

        transport.send_ping().await?;
        transport.send(b"\r\n").await?;
        info!("Serial port {} open at {} baud", transport.name, baud_rate);

        Ok((transport, rx))
    }

    /// Run a blocking operation against the open port.
    async fn with_port<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn SerialPort>) -> Result<T> + Send + 'static,
    {
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = port
                .lock()
                .map_err(|_| BoardError::Io(std::io::Error::other("serial port lock poisoned")))?;
            match guard.as_mut() {
                Some(port) => op(port),
                None => Err(BoardError::NotConnected),
            }
        })
        .await
        .map_err(|e| BoardError::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        trace!("Serial write {} bytes", data.len());
        self.with_port(move |port| {
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    /// Serial links have no echo request; asserting the modem lines fails
    /// once the device is unplugged. On Windows RTS is raised so the MCU
    /// does not stay in its bootloader after a hardware restart.
    async fn send_ping(&self) -> Result<()> {
        self.with_port(|port| {
            if cfg!(windows) {
                port.write_request_to_send(true)?;
            } else {
                port.write_data_terminal_ready(true)?;
            }
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> Result<()> {
        self.with_port(|port| {
            port.clear(ClearBuffer::All)?;
            Ok(())
        })
        .await
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = port.lock() {
                guard.take();
            }
        })
        .await
        .map_err(|e| BoardError::Io(std::io::Error::other(e)))?;
        debug!("Serial port {} closed", self.name);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn spawn_reader_thread(
    mut reader: Box<dyn SerialPort>,
    tx: TransportEventSender,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    thread::spawn(move || {
        let mut buf = vec![0u8; 4096];
        while !stop.load(Ordering::SeqCst) {
            match reader.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    trace!("Serial read {} bytes", n);
                    if tx.send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !stop.load(Ordering::SeqCst) {
                        warn!("Serial read failed: {}", e);
                        connected.store(false, Ordering::SeqCst);
                        let _ = tx.send(TransportEvent::Error(e.to_string()));
                    }
                    break;
                }
            }
        }
        debug!("Serial reader stopped");
    });
}

/// A serial port that may have a board attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardPort {
    pub name: String,
    pub manufacturer: String,
}

/// All serial ports except Bluetooth ones, with ports from allow-listed
/// manufacturers first, in allow-list order.
pub fn list_boards(manufacturers: &[String]) -> Result<Vec<BoardPort>> {
    let ports = serialport::available_ports()?
        .into_iter()
        .map(|info| {
            let manufacturer = match info.port_type {
                SerialPortType::UsbPort(usb) => usb
                    .manufacturer
                    .unwrap_or_else(|| format!("{:04x}", usb.vid)),
                _ => UNKNOWN_MANUFACTURER.to_string(),
            };
            BoardPort {
                name: info.port_name,
                manufacturer,
            }
        })
        .collect();

    Ok(rank_ports(ports, manufacturers))
}

/// Only the ports whose manufacturer is allow-listed.
pub fn list_target_boards(manufacturers: &[String]) -> Result<Vec<BoardPort>> {
    Ok(list_boards(manufacturers)?
        .into_iter()
        .filter(|port| manufacturers.contains(&port.manufacturer))
        .collect())
}

fn rank_ports(ports: Vec<BoardPort>, manufacturers: &[String]) -> Vec<BoardPort> {
    let mut ports: Vec<BoardPort> = ports
        .into_iter()
        .filter(|port| !port.name.is_empty() && !port.name.contains("Bluetooth"))
        .collect();

    // Stable sort keeps enumeration order within a rank
    ports.sort_by_key(|port| {
        manufacturers
            .iter()
            .position(|m| *m == port.manufacturer)
            .unwrap_or(usize::MAX)
    });
    ports
}
