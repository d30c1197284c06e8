use btleplug::{
    api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter},
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, WalkingPadError},
    types::parse_mac,
    WALKINGPAD_SERVICE_UUID,
};

/// Name prefixes WalkingPads advertise under
pub const NAME_PREFIXES: [&str; 2] = ["WalkingPad", "KS-"];

/// A pad seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadAdvertisement {
    /// Advertised local name
    pub name: Option<String>,
    /// Bluetooth address in lower-case colon-separated form
    pub address: String,
    /// Signal strength
    pub rssi: Option<i16>,
}

impl PadAdvertisement {
    /// Label shown when picking a pad, e.g. `"57:4c:4e:27:1a:2b (WalkingPad)"`
    ///
    /// Passing this straight to [`crate::PadConfig::new`] is accepted.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({name})", self.address),
            None => self.address.clone(),
        }
    }
}

/// Whether an advertisement looks like a WalkingPad
#[must_use]
pub fn is_walkingpad(name: Option<&str>, services: &[Uuid], service_uuid: Uuid) -> bool {
    services.contains(&service_uuid)
        || name.is_some_and(|n| NAME_PREFIXES.iter().any(|p| n.starts_with(p)))
}

/// Finds WalkingPads with the first Bluetooth adapter
pub struct BleScanner {
    manager: Manager,
}

impl BleScanner {
    /// Create a scanner
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    async fn central(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(WalkingPadError::NoAdapter)
    }

    /// Scan for `scan_timeout` and report every pad seen
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::NoAdapter`] if no adapter is available, or
    /// [`WalkingPadError::Ble`] if scanning fails.
    pub async fn scan_for_pads(&self, scan_timeout: Duration) -> Result<Vec<PadAdvertisement>> {
        info!("Scanning for WalkingPads...");

        let central = self.central().await?;
        let service_uuid = walkingpad_service_uuid()?;

        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(scan_timeout).await;
        central.stop_scan().await?;

        let mut pads = Vec::new();
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };

            if is_walkingpad(
                properties.local_name.as_deref(),
                &properties.services,
                service_uuid,
            ) {
                let pad = PadAdvertisement {
                    name: properties.local_name,
                    address: properties.address.to_string().to_lowercase(),
                    rssi: properties.rssi,
                };
                debug!(address = %pad.address, name = ?pad.name, "Found WalkingPad");
                pads.push(pad);
            }
        }

        info!("Scan completed. Found {} WalkingPad(s)", pads.len());
        Ok(pads)
    }

    /// Find the peripheral with `address`, scanning for up to `scan_timeout`
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::InvalidAddress`] for a malformed address,
    /// [`WalkingPadError::NoAdapter`] if no adapter is available, or
    /// [`WalkingPadError::DeviceNotFound`] if the pad was not seen in time.
    pub async fn locate(&self, address: &str, scan_timeout: Duration) -> Result<Peripheral> {
        let target = BDAddr::from(parse_mac(address)?);
        let central = self.central().await?;

        if let Some(peripheral) = find_known(&central, target).await? {
            debug!(address = %target, "Pad already known to the adapter");
            return Ok(peripheral);
        }

        let mut events = central.events().await?;
        central.start_scan(ScanFilter::default()).await?;
        info!(address = %target, ?scan_timeout, "Scanning for WalkingPad");

        let search = async {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDiscovered(id) = event {
                    match central.peripheral(&id).await {
                        Ok(peripheral) if peripheral.address() == target => {
                            return Some(peripheral);
                        }
                        Ok(_) => {}
                        Err(e) => debug!(error = %e, "Ignoring unreadable peripheral"),
                    }
                }
            }
            None
        };
        let found = timeout(scan_timeout, search).await.ok().flatten();

        if let Err(e) = central.stop_scan().await {
            warn!(error = %e, "Failed to stop scan");
        }

        found.ok_or_else(|| {
            warn!(address = %target, "WalkingPad not found");
            WalkingPadError::DeviceNotFound {
                address: address.to_string(),
            }
        })
    }
}

async fn find_known(central: &Adapter, target: BDAddr) -> Result<Option<Peripheral>> {
    Ok(central
        .peripherals()
        .await?
        .into_iter()
        .find(|p| p.address() == target))
}

fn walkingpad_service_uuid() -> Result<Uuid> {
    Uuid::parse_str(WALKINGPAD_SERVICE_UUID)
        .map_err(|e| WalkingPadError::Config(format!("Invalid service UUID: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_parsing() {
        let service = walkingpad_service_uuid().unwrap();
        assert_eq!(service.as_u128() >> 96, 0x0000_fe00);
    }

    #[test]
    fn test_walkingpad_detection() {
        let service = walkingpad_service_uuid().unwrap();
        let other = Uuid::parse_str("0000180d-0000-1000-8000-00805f9b34fb").unwrap();

        assert!(is_walkingpad(None, &[service], service));
        assert!(is_walkingpad(Some("WalkingPad A1"), &[], service));
        assert!(is_walkingpad(Some("KS-ST-A1P"), &[other], service));
        assert!(!is_walkingpad(Some("Heart Rate"), &[other], service));
        assert!(!is_walkingpad(None, &[], service));
    }

    #[test]
    fn test_advertisement_label_round_trips_through_config() {
        let pad = PadAdvertisement {
            name: Some("WalkingPad".to_string()),
            address: "57:4c:4e:27:1a:2b".to_string(),
            rssi: Some(-60),
        };
        assert_eq!(pad.label(), "57:4c:4e:27:1a:2b (WalkingPad)");

        let config = crate::PadConfig::new("", &pad.label()).unwrap();
        assert_eq!(config.address, pad.address);
    }
}
