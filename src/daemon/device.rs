use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
#[allow(unused_imports)]
use tun::AbstractDevice;

#[derive(Clone)]
pub struct DeviceConfig {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub mtu: u16,
}

/// The TUN device task
///
/// Packets read from the device head out the overlay (`outbound_tx`);
/// decrypted payloads from the inbound workers arrive on `inbound_rx` and
/// are written back to the device.
pub struct Device {
    config: DeviceConfig,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        outbound_tx: mpsc::Sender<Vec<u8>>,
        inbound_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            config,
            outbound_tx,
            inbound_rx,
        }
    }

    pub async fn run(&mut self) -> crate::Result<()> {
        let mut config = tun::Configuration::default();
        config
            .address(self.config.ip)
            .netmask(self.config.mask)
            .mtu(self.config.mtu)
            .up();

        #[cfg(target_os = "linux")]
        config.platform_config(|config| {
            config.ensure_root_privileges(true);
        });

        let mut dev = match tun::create_as_async(&config) {
            Ok(dev) => dev,
            Err(e) => {
                return Err(e.into());
            }
        };
        tracing::info!("tun device up at {}/{}", self.config.ip, self.config.mask);

        let mut buf = vec![0; 2048];
        loop {
            tokio::select! {
                amount = dev.read(&mut buf) => {
                    let amount = match amount {
                        Ok(amount) => amount,
                        Err(e) => {
                            tracing::error!("read device fail: {:?}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.outbound_tx.send(buf[0..amount].to_vec()).await {
                        tracing::error!("device => overlay fail: {}", e);
                    }
                }
                packet = self.inbound_rx.recv() => {
                    match packet {
                        Some(packet) => {
                            tracing::debug!("overlay => device {} bytes", packet.len());
                            if let Err(e) = dev.write_all(&packet).await {
                                tracing::error!("write device fail: {:?}", e);
                            }
                        }
                        None => {
                            tracing::info!("device write channel closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
