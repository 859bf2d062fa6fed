//! Connection lifecycle.
//!
//! A [`Connection`] owns the namespace connection, the locator and the
//! thread's context, declared in that order so that dropping it releases
//! them in reverse order of acquisition.  [`ConnectionManager`] hands out
//! shared [`ConnectionHandle`]s: the first `acquire` opens the connection,
//! later calls return the live one, and the last handle to go closes it.
//!
//! Handles are `Rc`-based.  A connection belongs to the thread that opened
//! it; monitor threads open their own.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::config::BindingConfig;
use crate::errors::{NativeStatus, WbemError, WBEM_E_FAILED};
use crate::provider::{ApartmentScope, Provider, WbemLocator, WbemServices};

/// Shared handle to an open connection.
pub type ConnectionHandle = Rc<Connection>;

pub struct Connection {
    services: Box<dyn WbemServices>,
    _locator: Box<dyn WbemLocator>,
    _apartment: Box<dyn ApartmentScope>,
    config: BindingConfig,
}

impl Connection {
    /// Initialise the calling thread's context, create a locator and connect
    /// to the configured namespace.
    ///
    /// Any failure is fatal and reported as
    /// [`WbemError::Initialization`] naming the stage that failed.
    pub fn open<P: Provider + ?Sized>(
        provider: &P,
        config: &BindingConfig,
    ) -> Result<Self, WbemError> {
        let apartment = provider.initialize().map_err(|e| fatal("initialize", e))?;
        if !apartment.owns_context() {
            warn!("{}: joined an existing thread context", provider.name());
        }
        let locator = provider.locator().map_err(|e| fatal("locator", e))?;
        let services = locator
            .connect_server(&config.namespace)
            .map_err(|e| fatal("ConnectServer", e))?;
        debug!("{}: connected to {}", provider.name(), config.namespace);
        Ok(Self {
            services,
            _locator: locator,
            _apartment: apartment,
            config: config.clone(),
        })
    }

    pub fn services(&self) -> &dyn WbemServices {
        &*self.services
    }

    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("closing connection to {}", self.config.namespace);
    }
}

fn fatal(stage: &str, err: WbemError) -> WbemError {
    match err {
        WbemError::Native { status, .. } => WbemError::initialization(stage, status),
        WbemError::Initialization { .. } => err,
        other => WbemError::initialization(
            stage,
            NativeStatus::with_text(WBEM_E_FAILED, other.to_string()),
        ),
    }
}

/// Explicit owner of the per-thread connection.
pub struct ConnectionManager<P> {
    provider: P,
    config: BindingConfig,
    live: RefCell<Weak<Connection>>,
}

impl<P: Provider> ConnectionManager<P> {
    pub fn new(provider: P, config: BindingConfig) -> Self {
        Self {
            provider,
            config,
            live: RefCell::new(Weak::new()),
        }
    }

    /// Return the live connection, opening it on first use.
    pub fn acquire(&self) -> Result<ConnectionHandle, WbemError> {
        if let Some(conn) = self.live.borrow().upgrade() {
            return Ok(conn);
        }
        let conn = Rc::new(Connection::open(&self.provider, &self.config)?);
        *self.live.borrow_mut() = Rc::downgrade(&conn);
        Ok(conn)
    }

    /// Give a handle back; the last release closes the connection.
    pub fn release(&self, handle: ConnectionHandle) {
        let last = Rc::strong_count(&handle) == 1;
        drop(handle);
        if last {
            debug!("last connection handle released");
        }
    }

    /// Number of live handles.
    pub fn acquire_count(&self) -> usize {
        self.live.borrow().strong_count()
    }

    pub fn is_open(&self) -> bool {
        self.acquire_count() > 0
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &BindingConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{WBEM_E_ACCESS_DENIED, WBEM_E_INVALID_NAMESPACE};
    use crate::memory::{Fixture, MemoryProvider, Operation};

    fn manager() -> (MemoryProvider, ConnectionManager<MemoryProvider>) {
        let provider = MemoryProvider::new(Fixture::default()).unwrap();
        let manager = ConnectionManager::new(provider.clone(), BindingConfig::default());
        (provider, manager)
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let (_, manager) = manager();
        assert!(!manager.is_open());
        let first = manager.acquire().unwrap();
        let second = manager.acquire().unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(manager.acquire_count(), 2);
        assert_eq!(first.namespace(), "ROOT\\CIMV2");
    }

    #[test]
    fn test_last_release_closes() {
        let (_, manager) = manager();
        let first = manager.acquire().unwrap();
        let second = manager.acquire().unwrap();
        manager.release(first);
        assert!(manager.is_open());
        manager.release(second);
        assert!(!manager.is_open());
        // reopens on demand
        let _again = manager.acquire().unwrap();
        assert_eq!(manager.acquire_count(), 1);
    }

    #[test]
    fn test_failed_initialization_is_fatal() {
        let (provider, manager) = manager();
        provider.fail_next(Operation::Initialize, WBEM_E_ACCESS_DENIED);
        let err = manager.acquire().err().unwrap();
        assert!(err.is_fatal());
        assert!(matches!(err, WbemError::Initialization { ref stage, .. } if stage == "initialize"));
        assert!(!manager.is_open());
    }

    struct NoLocator(MemoryProvider);

    impl Provider for NoLocator {
        fn name(&self) -> &'static str {
            "no-locator"
        }

        fn initialize(&self) -> Result<Box<dyn ApartmentScope>, WbemError> {
            self.0.initialize()
        }

        fn locator(&self) -> Result<Box<dyn WbemLocator>, WbemError> {
            Err(WbemError::Config("locator class not registered".to_owned()))
        }
    }

    #[test]
    fn test_non_native_setup_failure_is_still_fatal() {
        let provider = NoLocator(MemoryProvider::new(Fixture::default()).unwrap());
        let err = Connection::open(&provider, &BindingConfig::default())
            .err()
            .unwrap();
        assert!(err.is_fatal());
        assert_eq!(err.status_code(), Some(WBEM_E_FAILED));
        assert!(matches!(err, WbemError::Initialization { ref stage, .. } if stage == "locator"));
        assert!(err.to_string().contains("locator class not registered"));
    }

    #[test]
    fn test_bad_namespace_names_connect_stage() {
        let provider = MemoryProvider::new(Fixture::default()).unwrap();
        let config = BindingConfig {
            namespace: "ROOT\\Missing".to_owned(),
            ..BindingConfig::default()
        };
        let err = Connection::open(&provider, &config).err().unwrap();
        assert_eq!(err.status_code(), Some(WBEM_E_INVALID_NAMESPACE));
        assert!(matches!(err, WbemError::Initialization { ref stage, .. } if stage == "ConnectServer"));
    }
}
