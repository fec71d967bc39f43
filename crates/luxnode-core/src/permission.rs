//! Link permission collaborator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Platform permission source for using the radio link.
pub trait PermissionProvider: Send + Sync {
    fn are_granted(&self) -> bool;
    fn is_request_in_progress(&self) -> bool;
    /// Ask the user (or platform) to grant the permission. Fire and forget.
    fn request(&self);
}

/// Provider for platforms without a runtime permission model.
pub struct AlwaysGranted;

impl PermissionProvider for AlwaysGranted {
    fn are_granted(&self) -> bool {
        true
    }

    fn is_request_in_progress(&self) -> bool {
        false
    }

    fn request(&self) {}
}

/// Deduplicates permission requests: at most one `request()` per
/// granted -> not-granted edge.
pub(crate) struct PermissionGate {
    provider: Arc<dyn PermissionProvider>,
    requested: AtomicBool,
}

impl PermissionGate {
    pub fn new(provider: Arc<dyn PermissionProvider>) -> Self {
        Self {
            provider,
            requested: AtomicBool::new(false),
        }
    }

    /// Returns whether the link may be used, requesting permission if not.
    pub fn check(&self) -> bool {
        if self.provider.are_granted() {
            self.requested.store(false, Ordering::SeqCst);
            return true;
        }
        self.request_once();
        false
    }

    /// Trigger the permission flow unless already asked since the last grant.
    pub fn request_once(&self) {
        if self.provider.is_request_in_progress() {
            return;
        }
        if !self.requested.swap(true, Ordering::SeqCst) {
            tracing::info!("Requesting link permission");
            self.provider.request();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Permission provider toggled by tests.
    #[derive(Default)]
    pub(crate) struct ManualPermissions {
        pub denied: AtomicBool,
        pub requests: AtomicUsize,
    }

    impl ManualPermissions {
        pub fn denied() -> Self {
            let p = Self::default();
            p.denied.store(true, Ordering::SeqCst);
            p
        }
    }

    impl PermissionProvider for ManualPermissions {
        fn are_granted(&self) -> bool {
            !self.denied.load(Ordering::SeqCst)
        }

        fn is_request_in_progress(&self) -> bool {
            false
        }

        fn request(&self) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_request_deduplicated_until_granted() {
        let provider = Arc::new(ManualPermissions::denied());
        let gate = PermissionGate::new(provider.clone());

        assert!(!gate.check());
        assert!(!gate.check());
        gate.request_once();
        assert_eq!(provider.requests.load(Ordering::SeqCst), 1);

        provider.denied.store(false, Ordering::SeqCst);
        assert!(gate.check());

        provider.denied.store(true, Ordering::SeqCst);
        assert!(!gate.check());
        assert_eq!(provider.requests.load(Ordering::SeqCst), 2);
    }
}
