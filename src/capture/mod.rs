//! Screen capture
//!
//! Capture sources, the grant chain that obtains them, and the shipped
//! providers (X11 root window, synthetic test pattern).

pub mod capturer;
pub mod frame;
mod synthetic;
mod x11;

pub use capturer::{CaptureProvider, CaptureRequest, CaptureSource, GrantPath};
pub use frame::{Frame, FrameStats};
pub use synthetic::{SyntheticProvider, SyntheticSource};
pub use x11::{X11Capturer, X11Provider};

use log::{info, warn};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Capture-related errors
#[derive(Debug)]
pub enum CaptureError {
    /// No grant path produced a source
    Unavailable(String),
    /// An open source stopped producing frames
    SourceFailed(String),
    /// The engine already owns a running worker
    AlreadyRunning,
    /// `start` called before `configure`
    NotConfigured,
    /// Hardware encoder could not be created
    Encoder(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Unavailable(msg) => write!(f, "Capture unavailable: {}", msg),
            CaptureError::SourceFailed(msg) => write!(f, "Capture source failed: {}", msg),
            CaptureError::AlreadyRunning => write!(f, "Capture already running"),
            CaptureError::NotConfigured => write!(f, "Capture engine not configured"),
            CaptureError::Encoder(msg) => write!(f, "Encoder unavailable: {}", msg),
        }
    }
}

impl Error for CaptureError {}

/// Ordered list of providers, system grant first
#[derive(Clone, Default)]
pub struct GrantChain {
    providers: Vec<Arc<dyn CaptureProvider>>,
}

impl GrantChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn CaptureProvider>) -> Self {
        self.providers.push(provider);
        self.providers.sort_by_key(|p| match p.grant() {
            GrantPath::System => 0,
            GrantPath::Permission => 1,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Open the first source any provider grants
    pub fn open(&self, request: &CaptureRequest) -> Result<(Box<dyn CaptureSource>, GrantPath), CaptureError> {
        let mut attempts = Vec::new();
        for provider in &self.providers {
            match provider.open(request) {
                Ok(source) => {
                    info!(
                        "Capture source '{}' granted via {} path ({}x{})",
                        provider.name(),
                        provider.grant(),
                        request.width,
                        request.height
                    );
                    return Ok((source, provider.grant()));
                }
                Err(e) => {
                    warn!("Capture provider '{}' failed: {}", provider.name(), e);
                    attempts.push(format!("{}: {}", provider.name(), e));
                }
            }
        }
        if attempts.is_empty() {
            return Err(CaptureError::Unavailable("no capture providers registered".to_string()));
        }
        Err(CaptureError::Unavailable(attempts.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Refusing(GrantPath);

    impl CaptureProvider for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn grant(&self) -> GrantPath {
            self.0
        }

        fn open(&self, _request: &CaptureRequest) -> Result<Box<dyn CaptureSource>, CaptureError> {
            Err(CaptureError::Unavailable("denied".to_string()))
        }
    }

    fn request() -> CaptureRequest {
        CaptureRequest { width: 64, height: 32, density: 160 }
    }

    #[test]
    fn empty_chain_is_unavailable() {
        let result = GrantChain::new().open(&request());
        assert!(matches!(result, Err(CaptureError::Unavailable(_))));
    }

    #[test]
    fn falls_through_to_permission_grant() {
        let chain = GrantChain::new()
            .with_provider(Arc::new(SyntheticProvider::new(GrantPath::Permission)))
            .with_provider(Arc::new(Refusing(GrantPath::System)));
        let (mut source, grant) = chain.open(&request()).expect("open");
        assert_eq!(grant, GrantPath::Permission);
        let frame = source.next_frame().expect("frame");
        assert_eq!((frame.width, frame.height), (64, 32));
    }

    #[test]
    fn reports_every_failed_attempt() {
        let chain = GrantChain::new()
            .with_provider(Arc::new(Refusing(GrantPath::System)))
            .with_provider(Arc::new(Refusing(GrantPath::Permission)));
        match chain.open(&request()) {
            Err(CaptureError::Unavailable(msg)) => assert_eq!(msg.matches("refusing").count(), 2),
            _ => panic!("expected unavailable"),
        }
    }
}
