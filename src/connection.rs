//! Network link selection.
//!
//! The host reports which links are up through a [`Connectivity`]
//! implementation; a [`ConnectionChain`] walks its configured links in order
//! and uploads through the first one that is available.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::archive::Archive;
use crate::protocol::UploadProtocol;
use crate::transport::TransportError;
use crate::worker::Shutdown;

/// Reports the current link state of the device.
pub trait Connectivity: Send + Sync {
    fn is_wifi_available(&self) -> bool;

    fn is_mobile_available(&self) -> bool;

    fn is_any_available(&self) -> bool {
        self.is_wifi_available() || self.is_mobile_available()
    }
}

/// Connectivity flags set by the host from its own network monitor.
#[derive(Debug)]
pub struct ManualConnectivity {
    wifi: AtomicBool,
    mobile: AtomicBool,
}

impl ManualConnectivity {
    pub fn new(wifi: bool, mobile: bool) -> Self {
        Self {
            wifi: AtomicBool::new(wifi),
            mobile: AtomicBool::new(mobile),
        }
    }

    /// Both links down.
    pub fn offline() -> Self {
        Self::new(false, false)
    }

    pub fn set_wifi(&self, available: bool) {
        self.wifi.store(available, Ordering::SeqCst);
    }

    pub fn set_mobile(&self, available: bool) {
        self.mobile.store(available, Ordering::SeqCst);
    }
}

impl Default for ManualConnectivity {
    /// Wi-Fi up, mobile down.
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl Connectivity for ManualConnectivity {
    fn is_wifi_available(&self) -> bool {
        self.wifi.load(Ordering::SeqCst)
    }

    fn is_mobile_available(&self) -> bool {
        self.mobile.load(Ordering::SeqCst)
    }
}

/// One link of a connection chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStrategy {
    Wlan,
    Mobile,
    AnyAvailable,
}

impl ConnectionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionStrategy::Wlan => "wlan",
            ConnectionStrategy::Mobile => "mobile",
            ConnectionStrategy::AnyAvailable => "any",
        }
    }

    pub fn is_available(&self, connectivity: &dyn Connectivity) -> bool {
        match self {
            ConnectionStrategy::Wlan => connectivity.is_wifi_available(),
            ConnectionStrategy::Mobile => connectivity.is_mobile_available(),
            ConnectionStrategy::AnyAvailable => connectivity.is_any_available(),
        }
    }
}

/// Named link preference, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionSelection {
    Wlan,
    Mobile,
    WlanElseMobile,
    #[default]
    Any,
}

impl ConnectionSelection {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "wlan" | "wifi" => Some(ConnectionSelection::Wlan),
            "mobile" => Some(ConnectionSelection::Mobile),
            "wlan_else_mobile" => Some(ConnectionSelection::WlanElseMobile),
            "any" => Some(ConnectionSelection::Any),
            _ => None,
        }
    }

    /// Like [`parse`](Self::parse), falling back to `Any` for unknown names.
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            warn!(name, "Unknown connection selection, falling back to 'any'");
            ConnectionSelection::Any
        })
    }

    pub fn links(&self) -> Vec<ConnectionStrategy> {
        match self {
            ConnectionSelection::Wlan => vec![ConnectionStrategy::Wlan],
            ConnectionSelection::Mobile => vec![ConnectionStrategy::Mobile],
            ConnectionSelection::WlanElseMobile => {
                vec![ConnectionStrategy::Wlan, ConnectionStrategy::Mobile]
            }
            ConnectionSelection::Any => vec![ConnectionStrategy::AnyAvailable],
        }
    }
}

/// Ordered list of links to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChain {
    links: Vec<ConnectionStrategy>,
}

impl ConnectionChain {
    pub fn new(links: Vec<ConnectionStrategy>) -> Self {
        Self { links }
    }

    pub fn from_selection(selection: ConnectionSelection) -> Self {
        Self::new(selection.links())
    }

    pub fn links(&self) -> &[ConnectionStrategy] {
        &self.links
    }

    /// Upload `archive` over the first available link.
    ///
    /// The protocol runs at most once; its result is final even if a later
    /// link would also be available.
    pub async fn do_work(
        &self,
        connectivity: &dyn Connectivity,
        protocol: &dyn UploadProtocol,
        archive: &Archive,
        shutdown: &Shutdown,
    ) -> Result<ConnectionStrategy, TransportError> {
        for link in &self.links {
            if !link.is_available(connectivity) {
                debug!(link = link.name(), "Link unavailable");
                continue;
            }

            debug!(
                link = link.name(),
                protocol = protocol.name(),
                archive = %archive.file_name(),
                "Uploading over link"
            );
            protocol.upload_file(&archive.path, shutdown).await?;
            return Ok(*link);
        }

        Err(TransportError::ConnectionUnavailable)
    }
}

impl fmt::Display for ConnectionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.links.iter().map(|l| l.name()).collect();
        write!(f, "{}", names.join(" -> "))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::ProtocolError;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;

    /// Protocol double counting invocations.
    #[derive(Default)]
    pub(crate) struct CountingProtocol {
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
    }

    #[async_trait]
    impl UploadProtocol for CountingProtocol {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn upload_file(&self, _path: &Path, _shutdown: &Shutdown) -> Result<(), ProtocolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(ProtocolError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    fn archive() -> Archive {
        Archive {
            path: PathBuf::from("/tmp/dev-1.zip"),
            encrypted: false,
        }
    }

    #[test]
    fn test_selection_parsing() {
        assert_eq!(ConnectionSelection::parse("WLAN"), Some(ConnectionSelection::Wlan));
        assert_eq!(
            ConnectionSelection::parse("wlan_else_mobile"),
            Some(ConnectionSelection::WlanElseMobile)
        );
        assert_eq!(ConnectionSelection::parse("carrier-pigeon"), None);
        assert_eq!(
            ConnectionSelection::from_name("carrier-pigeon"),
            ConnectionSelection::Any
        );
    }

    #[test]
    fn test_chain_display() {
        let chain = ConnectionChain::from_selection(ConnectionSelection::WlanElseMobile);
        assert_eq!(chain.to_string(), "wlan -> mobile");
    }

    #[tokio::test]
    async fn test_falls_back_to_mobile_once() {
        let (_trigger, shutdown) = Shutdown::channel();
        let connectivity = ManualConnectivity::new(false, true);
        let protocol = CountingProtocol::default();
        let chain = ConnectionChain::from_selection(ConnectionSelection::WlanElseMobile);

        let link = chain
            .do_work(&connectivity, &protocol, &archive(), &shutdown)
            .await
            .unwrap();
        assert_eq!(link, ConnectionStrategy::Mobile);
        assert_eq!(protocol.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_protocol_failure_is_final() {
        let (_trigger, shutdown) = Shutdown::channel();
        let connectivity = ManualConnectivity::new(true, true);
        let protocol = CountingProtocol::default();
        protocol.fail.store(true, Ordering::SeqCst);
        let chain = ConnectionChain::from_selection(ConnectionSelection::WlanElseMobile);

        let err = chain
            .do_work(&connectivity, &protocol, &archive(), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(ProtocolError::Timeout)));
        assert_eq!(protocol.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_link_available() {
        let (_trigger, shutdown) = Shutdown::channel();
        let connectivity = ManualConnectivity::offline();
        let protocol = CountingProtocol::default();
        let chain = ConnectionChain::from_selection(ConnectionSelection::Any);

        let err = chain
            .do_work(&connectivity, &protocol, &archive(), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionUnavailable));
        assert_eq!(protocol.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wlan_only_ignores_mobile() {
        let (_trigger, shutdown) = Shutdown::channel();
        let connectivity = ManualConnectivity::new(false, true);
        let protocol = CountingProtocol::default();
        let chain = ConnectionChain::from_selection(ConnectionSelection::Wlan);

        assert!(chain
            .do_work(&connectivity, &protocol, &archive(), &shutdown)
            .await
            .is_err());
        assert_eq!(protocol.calls.load(Ordering::SeqCst), 0);

        connectivity.set_wifi(true);
        chain
            .do_work(&connectivity, &protocol, &archive(), &shutdown)
            .await
            .unwrap();
        assert_eq!(protocol.calls.load(Ordering::SeqCst), 1);
    }
}
