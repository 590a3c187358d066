//! Operation context: the only channel for cross-cutting state.
//!
//! A context is created at the process boundary (a bus delivery, an HTTP request,
//! a timer tick) and threaded through every downstream call. It carries:
//!
//! - the bound [`Tenant`] (or none, which is distinct from an error),
//! - trace identity for log correlation,
//! - the "skip tenant filter" override used by administrative sweeps,
//! - a cancellation signal and an optional deadline.
//!
//! Contexts are cheap to clone; derivation methods return new values and never
//! mutate the parent.

use std::future::pending;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::tenant::Tenant;

pub const TRACE_ID_HEADER: &str = "TRACE_ID";
pub const SPAN_ID_HEADER: &str = "SPAN_ID";

/// Trace identity propagated through message headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceContext {
    trace_id: String,
    span_id: String,
}

impl TraceContext {
    /// Start a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
        }
    }

    pub fn from_parts(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
        }
    }

    /// Same trace, fresh span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

fn new_span_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..16].to_string()
}

/// Fires a [`Cancellation`] for every context derived from it.
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Receiving side of a cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    pub fn pair() -> (CancellationSource, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancellationSource { tx }, Cancellation { rx: Some(rx) })
    }

    /// A token that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Wrap a shutdown channel owned by a worker.
    pub fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancelled. Never resolves for [`Cancellation::never`] or when
    /// the source is dropped without firing.
    pub async fn cancelled(&self) {
        match &self.rx {
            Some(rx) => {
                let mut rx = rx.clone();
                if rx.wait_for(|c| *c).await.is_err() {
                    pending::<()>().await;
                }
            }
            None => pending::<()>().await,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    tenant: Option<Tenant>,
    trace: Option<TraceContext>,
    skip_tenant_filter: bool,
    cancellation: Cancellation,
    deadline: Option<Instant>,
}

impl OperationContext {
    /// Unbound context for startup and background paths.
    pub fn background() -> Self {
        Self::default()
    }

    /// Bind a tenant. Binding twice overrides the earlier tenant.
    pub fn with_tenant(mut self, tenant: Tenant) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn tenant(&self) -> Option<&Tenant> {
        self.tenant.as_ref()
    }

    pub fn require_tenant(&self) -> CoreResult<&Tenant> {
        self.tenant.as_ref().ok_or(CoreError::NoTenantInContext)
    }

    /// Mark the context as exempt from automatic tenant filtering.
    pub fn without_tenant_filter(mut self) -> Self {
        self.skip_tenant_filter = true;
        self
    }

    pub fn skips_tenant_filter(&self) -> bool {
        self.skip_tenant_filter
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Derive a deadline `timeout` from now. An earlier existing deadline wins.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Short-circuit I/O on a cancelled context.
    pub fn ensure_active(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => pending::<()>().await,
            }
        };
        tokio::select! {
            _ = deadline => {}
            _ = self.cancellation.cancelled() => {}
        }
    }
}
