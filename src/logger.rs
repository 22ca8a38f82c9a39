use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::LocalBoxFuture;
use log::{info, warn};
use std::rc::Rc;
use std::time::Instant;

/// Request logger middleware
///
/// One line when a request starts and one when it completes, with status
/// and latency. Query strings are not logged.
pub struct LoggerMiddleware;

impl<S, B> Transform<S, ServiceRequest> for LoggerMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = LoggerMiddlewareService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(LoggerMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct LoggerMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for LoggerMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let path = req.path().to_string();

        info!("Request started: {} {}", method, path);

        let service = self.service.clone();

        Box::pin(async move {
            let res = service.call(req).await;
            let elapsed = start_time.elapsed().as_millis();

            match &res {
                Ok(res) if res.status().is_client_error() || res.status().is_server_error() => {
                    warn!(
                        "Request failed: {} {} - Status: {} ({}ms)",
                        method,
                        path,
                        res.status().as_u16(),
                        elapsed
                    );
                }
                Ok(res) => {
                    info!(
                        "Request completed: {} {} - Status: {} ({}ms)",
                        method,
                        path,
                        res.status().as_u16(),
                        elapsed
                    );
                }
                // Rejected by an inner middleware before reaching a handler
                Err(e) => {
                    warn!(
                        "Request rejected: {} {} - Status: {} ({}ms)",
                        method,
                        path,
                        e.as_response_error().status_code().as_u16(),
                        elapsed
                    );
                }
            }

            res
        })
    }
}
