mod observer;

use std::sync::Arc;

use jsonrpsee::RpcModule;
use libp2p::PeerId;

use crate::{chain_observer::ChainObserver, engine::AttestationGatherer};

/// Everything the status API reads from.
#[derive(Clone)]
pub struct ApiContext {
    pub peer_id: PeerId,
    pub engine: Arc<AttestationGatherer>,
    pub observer: Arc<ChainObserver>,
}

pub fn rpc_module(context: ApiContext) -> RpcModule<ApiContext> {
    let mut module = RpcModule::new(context.clone());

    module.merge(observer::rpc_module(context)).unwrap();

    module
}

/// Returns an `RpcModule<ApiContext>`. Call with the following syntax:
/// ```ignore
/// declare_module!(
///     context,
///     [
///         ("method1", method_one),
///         ("method2", method_two),
///     ],
/// )
/// ```
///
/// where `context` is an `ApiContext` and each implementation method has the signature
/// `async fn(jsonrpsee::types::Params<'static>, Arc<ApiContext>) -> Result<T>`.
///
/// Will panic if any of the method names collide.
macro_rules! declare_module {
    (
        $context:expr,
        [ $(($name:expr, $method:expr)),* $(,)? ] $(,)?
    ) => {{
        let mut module: jsonrpsee::RpcModule<crate::api::ApiContext> =
            jsonrpsee::RpcModule::new($context);
        let meter = opentelemetry::global::meter("observer");

        $(
            let rpc_server_duration = meter
                .f64_histogram(opentelemetry_semantic_conventions::metric::RPC_SERVER_DURATION)
                .with_unit("ms")
                .build();
            module
                .register_async_method($name, move |params, context, _| {
                    let rpc_server_duration = rpc_server_duration.clone();
                    async move {
                        let mut attributes = vec![
                            opentelemetry::KeyValue::new("rpc.system", "jsonrpc"),
                            opentelemetry::KeyValue::new("rpc.service", "observer"),
                            opentelemetry::KeyValue::new("rpc.method", $name),
                            opentelemetry::KeyValue::new("network.transport", "tcp"),
                            opentelemetry::KeyValue::new("rpc.jsonrpc.version", "2.0"),
                        ];

                        let start = std::time::Instant::now();

                        let result = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
                            $method(params, context),
                        ))
                        .await
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("Unhandled panic in RPC handler {}", $name)));

                        let result = result.map_err(|e| {
                            // If the error is already an `ErrorObjectOwned`, we can just return that. Otherwise, wrap it
                            // with an `InternalError` code.
                            match e.downcast::<jsonrpsee::types::ErrorObjectOwned>() {
                                Ok(e) => e,
                                Err(e) => {
                                    tracing::error!(?e);
                                    jsonrpsee::types::ErrorObject::owned(
                                        jsonrpsee::types::error::ErrorCode::InternalError.code(),
                                        e.to_string(),
                                        None as Option<String>,
                                    )
                                }
                            }
                        });
                        if let Err(err) = &result {
                            attributes.push(opentelemetry::KeyValue::new(
                                "rpc.jsonrpc.error_code",
                                err.code() as i64,
                            ));
                        }
                        rpc_server_duration.record(start.elapsed().as_secs_f64() * 1000.0, &attributes);
                        result
                    }
                })
                .unwrap();
        )*

        module
    }}
}

use declare_module;
