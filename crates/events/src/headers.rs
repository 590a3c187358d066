//! Header parser chain: turns transport headers into an [`OperationContext`].

use std::sync::Arc;

use tracing::debug;

use atlas_core::context::{SPAN_ID_HEADER, TRACE_ID_HEADER};
use atlas_core::{HeaderLookup, OperationContext, Tenant, TraceContext};

use crate::message::Headers;

pub trait HeaderParser: Send + Sync + core::fmt::Debug {
    fn parse(&self, ctx: OperationContext, headers: &Headers) -> OperationContext;
}

/// Binds the tenant carried in `TENANT_ID`/`REGION`/`MAJOR_VERSION`/`MINOR_VERSION`.
///
/// Malformed or missing headers leave the context unbound; tenant-required
/// handlers then fail with `NoTenantInContext`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TenantHeaderParser;

impl HeaderParser for TenantHeaderParser {
    fn parse(&self, ctx: OperationContext, headers: &Headers) -> OperationContext {
        match Tenant::from_headers(headers) {
            Ok(tenant) => ctx.with_tenant(tenant),
            Err(err) => {
                debug!(error = %err, "message carries no usable tenant headers");
                ctx
            }
        }
    }
}

/// Continues the producer's trace, or starts a new one.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceHeaderParser;

impl HeaderParser for TraceHeaderParser {
    fn parse(&self, ctx: OperationContext, headers: &Headers) -> OperationContext {
        let trace = match (headers.header(TRACE_ID_HEADER), headers.header(SPAN_ID_HEADER)) {
            (Some(trace_id), Some(span_id)) if !trace_id.is_empty() => {
                TraceContext::from_parts(trace_id, span_id).child()
            }
            _ => TraceContext::new_root(),
        };
        ctx.with_trace(trace)
    }
}

pub fn default_parsers() -> Vec<Arc<dyn HeaderParser>> {
    vec![Arc::new(TenantHeaderParser), Arc::new(TraceHeaderParser)]
}

pub fn parse_headers(
    parsers: &[Arc<dyn HeaderParser>],
    ctx: OperationContext,
    headers: &Headers,
) -> OperationContext {
    parsers.iter().fold(ctx, |ctx, p| p.parse(ctx, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::TenantId;

    #[test]
    fn chain_binds_tenant_and_continues_trace() {
        let tenant = Tenant::new(TenantId::new(), "GMS", 83, 1).unwrap();
        let mut headers: Headers = tenant
            .to_headers()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        headers.insert(TRACE_ID_HEADER.into(), "abc".into());
        headers.insert(SPAN_ID_HEADER.into(), "def".into());

        let ctx = parse_headers(&default_parsers(), OperationContext::background(), &headers);
        assert_eq!(ctx.require_tenant().unwrap(), &tenant);
        assert_eq!(ctx.trace().unwrap().trace_id(), "abc");
        assert_ne!(ctx.trace().unwrap().span_id(), "def");
    }

    #[test]
    fn missing_headers_leave_context_unbound_with_fresh_trace() {
        let ctx = parse_headers(&default_parsers(), OperationContext::background(), &Headers::new());
        assert!(ctx.tenant().is_none());
        assert!(ctx.trace().is_some());
    }
}
