//! Timing instrumentation for response hooks.

use async_trait::async_trait;
use hyper::Response;
use image_proxy::{ExchangeContext, ProxyBody, ResponseHook};
use tracing::Instrument;

/// Wraps a [`ResponseHook`] in a span per exchange and logs how long the
/// exchange took once the inner hook has run.
#[derive(Debug)]
pub struct TimedResponseHook<H> {
    inner: H,
}

impl<H> TimedResponseHook<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: ResponseHook> ResponseHook for TimedResponseHook<H> {
    async fn on_response(&self, ctx: &ExchangeContext, res: Response<ProxyBody>) -> Response<ProxyBody> {
        let span = tracing::info_span!(
            "exchange",
            id = ctx.id,
            method = %ctx.method,
            uri = %ctx.uri,
        );

        async {
            let res = self.inner.on_response(ctx, res).await;
            tracing::info!(
                status = res.status().as_u16(),
                elapsed_ms = ctx.started.elapsed().as_millis() as u64,
                "response intercepted"
            );
            res
        }
        .instrument(span)
        .await
    }
}
