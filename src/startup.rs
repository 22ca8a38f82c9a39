use actix_web::dev::Server;
use actix_web::{error::JsonPayloadError, web, App, HttpRequest, HttpServer};
use std::net::TcpListener;

use crate::error::{AppError, ValidationError};
use crate::logger::LoggerMiddleware;
use crate::middleware::JwtMiddleware;
use crate::routes::{check_token, health_check, login, logout, refresh, register};
use crate::session::SessionService;
use crate::storage::Store;

/// Malformed or incomplete JSON bodies answer with the same 400 envelope as
/// field validation failures
fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    tracing::debug!(error = %err, "Rejected request body");
    AppError::Validation(ValidationError::InvalidFormat("request body".to_string())).into()
}

pub fn run<S: Store>(
    listener: TcpListener,
    session: SessionService<S>,
) -> Result<Server, std::io::Error> {
    let tokens = session.tokens().clone();
    let session = web::Data::new(session);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(LoggerMiddleware)
            .app_data(session.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .route("/health_check", web::get().to(health_check))
            .service(
                web::scope("/auth")
                    .route("/register", web::post().to(register::<S>))
                    .route("/login", web::post().to(login::<S>))
                    .route("/refresh", web::post().to(refresh::<S>))
                    .route("/logout", web::post().to(logout::<S>))
                    .service(
                        web::resource("/check-token")
                            .wrap(JwtMiddleware::new(tokens.clone()))
                            .route(web::get().to(check_token)),
                    ),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
