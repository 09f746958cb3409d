//! libpcap-based capture backend.

use pcap::{Active, Capture, Device, Linktype};
use tracing::{debug, error, info, warn};

use super::{CaptureSource, FrameCallback, Listener, NextPacket};
use crate::config::CaptureSettings;
use crate::error::{CaptureError, FilterError};
use crate::filter::{self, CompiledFilter, Resolver, SystemResolver};

/// A live pcap handle opened in promiscuous mode with a read timeout.
pub struct PcapSource {
    capture: Capture<Active>,
}

impl PcapSource {
    /// Open `device` for live capture using the configured snap length and timeout.
    pub fn open(device: Device, settings: &CaptureSettings) -> Result<Self, CaptureError> {
        let interface = device.name.clone();
        let open_error = |e: pcap::Error| CaptureError::Open {
            interface: interface.clone(),
            reason: e.to_string(),
        };

        let timeout_ms = i32::try_from(settings.read_timeout.as_millis()).unwrap_or(i32::MAX);
        let capture = Capture::from_device(device)
            .map_err(open_error)?
            .promisc(true)
            .snaplen(settings.snaplen)
            .timeout(timeout_ms)
            .open()
            .map_err(open_error)?;

        Ok(Self { capture })
    }

    pub fn datalink(&self) -> Linktype {
        self.capture.get_datalink()
    }

    /// Compile and install the exclusion filter on this handle.
    pub fn apply_filter(&mut self, expression: &str) -> Result<CompiledFilter, FilterError> {
        filter::compile_and_apply(&mut self.capture, expression)
    }
}

impl CaptureSource for PcapSource {
    fn next_packet(&mut self) -> NextPacket<'_> {
        match self.capture.next_packet() {
            Ok(packet) => NextPacket::Packet {
                timestamp: packet.header.ts.tv_sec as u32,
                data: packet.data,
            },
            Err(pcap::Error::TimeoutExpired) => NextPacket::Timeout,
            Err(e) => NextPacket::Error(e.to_string()),
        }
    }
}

/// Whether `interface` is the one carrying management traffic and should be filtered.
pub(crate) fn wants_exclusion_filter(settings: &CaptureSettings, interface: &str) -> bool {
    settings.filter_server_traffic
        && settings
            .management_interface
            .as_deref()
            .is_some_and(|management| management == interface)
}

fn exclusion_filter(
    source: &mut PcapSource,
    settings: &CaptureSettings,
    resolver: &dyn Resolver,
) -> Result<CompiledFilter, FilterError> {
    let expression =
        filter::build_exclusion_expression(&settings.server_url, &settings.monitor_url, resolver)?;
    source.apply_filter(&expression)
}

/// What to do with the management interface once its exclusion filter was attempted.
///
/// A failed filter either skips the interface (`strict`) or leaves it capturing
/// unfiltered.
pub(crate) fn filter_outcome(
    interface: &str,
    attempt: Result<CompiledFilter, FilterError>,
    strict: bool,
) -> Result<Option<CompiledFilter>, CaptureError> {
    match attempt {
        Ok(filter) => {
            info!(
                "Successfully applied filter '{}' to interface {}",
                filter.expression(),
                interface
            );
            Ok(Some(filter))
        }
        Err(source) if strict => Err(CaptureError::Filter {
            interface: interface.to_string(),
            source,
        }),
        Err(e) => {
            error!(
                "Capturing {} without exclusion filter, management traffic will be reported: {}",
                interface, e
            );
            Ok(None)
        }
    }
}

/// Open one listener per eligible interface.
///
/// Loopback interfaces, interfaces without addresses and non-Ethernet links are
/// skipped, as are interfaces that fail to open. The management interface gets
/// the exclusion filter.
pub fn build_listener_set(
    settings: &CaptureSettings,
    callback: FrameCallback,
) -> Result<Vec<Listener>, CaptureError> {
    let devices = Device::list().map_err(|e| CaptureError::Enumerate(e.to_string()))?;
    let mut listeners = Vec::new();

    for device in devices {
        let name = device.name.clone();

        if device.addresses.is_empty() || device.flags.is_loopback() {
            debug!("Skipping {}: loopback or no addresses", name);
            continue;
        }

        let mut source = match PcapSource::open(device, settings) {
            Ok(source) => source,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };

        // Only Ethernet framing is classified for now.
        let linktype = source.datalink();
        if linktype != Linktype::ETHERNET {
            let err = CaptureError::UnsupportedLinkType {
                interface: name,
                linktype: linktype.0,
            };
            info!("Skipping: {}", err);
            continue;
        }

        let filter = if wants_exclusion_filter(settings, &name) {
            let attempt = exclusion_filter(&mut source, settings, &SystemResolver);
            match filter_outcome(&name, attempt, settings.strict_filter) {
                Ok(filter) => filter,
                Err(err) => {
                    error!("{}; interface skipped", err);
                    continue;
                }
            }
        } else {
            None
        };

        info!("Listening on {}", name);
        listeners.push(Listener::new(name, Box::new(source), filter, callback.clone()));
    }

    if listeners.is_empty() {
        error!("There are no interfaces that match the supported criteria");
        return Err(CaptureError::NoInterfaces);
    }

    Ok(listeners)
}

/// Release every listener. Their threads must already have been joined.
pub fn release_listener_set(listeners: Vec<Listener>) {
    for listener in listeners {
        debug!(
            "Releasing listener on {} ({})",
            listener.interface(),
            listener.stats()
        );
        // Dropping closes the pcap handle and frees the compiled program.
        drop(listener);
    }
}

/// Describe every capture device, marking the ones a listener would be opened on.
pub fn list_interfaces() -> Result<Vec<String>, CaptureError> {
    let devices = Device::list().map_err(|e| CaptureError::Enumerate(e.to_string()))?;

    Ok(devices
        .into_iter()
        .map(|device| {
            let eligible = !device.addresses.is_empty() && !device.flags.is_loopback();
            let addrs: Vec<_> = device
                .addresses
                .iter()
                .map(|address| address.addr.to_string())
                .collect();
            format!(
                "{}: {} [{}]",
                device.name,
                if eligible { "capture" } else { "skip" },
                if addrs.is_empty() {
                    "no IP".to_string()
                } else {
                    addrs.join(", ")
                }
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::filter::compile_filter;
    use crate::filter::tests::dead_ethernet;

    fn compiled() -> CompiledFilter {
        compile_filter(&dead_ethernet(), "not host 203.0.113.5").unwrap()
    }

    fn failed() -> Result<CompiledFilter, FilterError> {
        Err(FilterError::Unresolved("collector.example.net".to_string()))
    }

    #[test]
    fn test_installed_filter_is_kept() {
        let filter = filter_outcome("em0", Ok(compiled()), false).unwrap();
        assert_eq!(filter, Some(compiled()));

        let filter = filter_outcome("em0", Ok(compiled()), true).unwrap();
        assert_eq!(filter, Some(compiled()));
    }

    #[test]
    fn test_failed_filter_degrades_to_unfiltered() {
        assert_eq!(filter_outcome("em0", failed(), false).unwrap(), None);
    }

    #[test]
    fn test_failed_filter_skips_interface_when_strict() {
        let err = filter_outcome("em0", failed(), true).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Filter { ref interface, source: FilterError::Unresolved(_) } if interface == "em0"
        ));
    }

    #[test]
    fn test_filter_only_on_management_interface() {
        let settings = sample_settings();
        assert!(wants_exclusion_filter(&settings, "em0"));
        assert!(!wants_exclusion_filter(&settings, "em1"));
    }

    #[test]
    fn test_no_management_interface_means_no_filter() {
        let mut settings = sample_settings();
        settings.management_interface = None;
        assert!(!wants_exclusion_filter(&settings, "em0"));
    }

    #[test]
    fn test_filtering_disabled() {
        let mut settings = sample_settings();
        settings.filter_server_traffic = false;
        assert!(!wants_exclusion_filter(&settings, "em0"));
    }
}
