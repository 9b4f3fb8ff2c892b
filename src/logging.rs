use std::fmt;

use crate::context::RequestContext;

/// Request-scoped logging interface.
///
/// `RequestLog` is obtained from `Ctx::log()` and is lifetime-bound to the
/// context. Every record carries the request id, the bound scope and the
/// effective role, so handler logs can be correlated with binder and audit
/// records for the same request.
#[derive(Debug)]
pub struct RequestLog<'a> {
    request_id: &'a str,
    context: &'a RequestContext,
}

impl<'a> RequestLog<'a> {
    /// Only `Ctx` creates loggers.
    pub(crate) fn new(request_id: &'a str, context: &'a RequestContext) -> Self {
        Self {
            request_id,
            context,
        }
    }

    /// Returns the request ID associated with this logger.
    pub fn request_id(&self) -> &str {
        self.request_id
    }

    /// Logs an info-level message.
    ///
    /// Use with `format_args!`:
    /// ```no_run
    /// # use tenancy_core::RequestLog;
    /// # fn example(log: &RequestLog<'_>) {
    /// log.info(format_args!("listed {} patients", 3));
    /// # }
    /// ```
    pub fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!(
            request_id = %self.request_id,
            scope = %self.context.scope(),
            role = %self.context.role(),
            "{}",
            args
        );
    }

    /// Logs a warning-level message.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!(
            request_id = %self.request_id,
            scope = %self.context.scope(),
            role = %self.context.role(),
            "{}",
            args
        );
    }

    /// Logs an error-level message.
    pub fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(
            request_id = %self.request_id,
            scope = %self.context.scope(),
            role = %self.context.role(),
            "{}",
            args
        );
    }

    /// Logs a debug-level message.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!(
            request_id = %self.request_id,
            scope = %self.context.scope(),
            "{}",
            args
        );
    }
}
