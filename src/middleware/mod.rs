/// Middleware module
///
/// Request authentication. Request logging lives in `logger`.

mod jwt_middleware;

pub use jwt_middleware::JwtMiddleware;
