mod auth;
mod health_check;

pub use auth::{
    check_token, login, logout, refresh, register, CheckTokenResponse, LoginRequest,
    LoginResponse, RegisterRequest, ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE,
};
pub use health_check::health_check;
