use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::auth::{AuthUser, hash_password, verify_password};
use crate::models::{
    ChangePasswordRequest, LoginRequest, RegisterRequest, UpdateProfileRequest, User, UserProfile,
};
use crate::service::{
    ApiError, ApiResult, AppState, bad_request, internal_error, success, success_message,
    unauthorized,
};
use crate::store::StoreError;

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let name = request.name.trim();
    let email = request.email.trim().to_lowercase();

    if name.is_empty() {
        return Err(bad_request("Name is required"));
    }
    if email.is_empty() || !email.contains('@') {
        return Err(bad_request("A valid email address is required"));
    }
    if request.password.len() < 6 {
        return Err(bad_request("Password must be at least 6 characters"));
    }

    let user = User::new(name, &email, hash_password(&request.password));
    let user = match state.users.create(user).await {
        Ok(user) => user,
        Err(StoreError::DuplicateEmail) => {
            return Err(bad_request("User already exists with this email"));
        }
        Err(e) => {
            error!("Failed to create user: {}", e);
            return Err(internal_error("Server error during registration"));
        }
    };

    info!("Registered user {}", user.id);
    let token = state.tokens.issue(&user.id);
    Ok((
        StatusCode::CREATED,
        success(json!({ "user": UserProfile::from(&user), "token": token })),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Value> {
    let email = request.email.trim().to_lowercase();

    let user = state.users.find_by_email(&email).await.map_err(|e| {
        error!("Failed to look up user by email: {}", e);
        internal_error("Server error during login")
    })?;

    // Same message for unknown email and wrong password.
    let Some(user) = user else {
        return Err(unauthorized("Invalid email or password"));
    };
    if !verify_password(&request.password, &user.password_hash) {
        return Err(unauthorized("Invalid email or password"));
    }

    info!("User {} logged in", user.id);
    let token = state.tokens.issue(&user.id);
    Ok(success(
        json!({ "user": UserProfile::from(&user), "token": token }),
    ))
}

pub async fn get_profile(auth: AuthUser) -> ApiResult<Value> {
    Ok(success(json!({ "user": UserProfile::from(&auth.user) })))
}

pub async fn update_profile(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<UpdateProfileRequest>,
) -> ApiResult<Value> {
    let Some(name) = request.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
        return Err(bad_request("Name is required"));
    };

    let user = state
        .users
        .update_name(&auth.user.id, name)
        .await
        .map_err(|e| {
            error!("Failed to update profile for {}: {}", auth.user.id, e);
            internal_error("Server error while updating profile")
        })?
        .ok_or_else(|| unauthorized("Invalid or expired token"))?;

    Ok(success(json!({ "user": UserProfile::from(&user) })))
}

pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<ChangePasswordRequest>,
) -> ApiResult<Value> {
    if !verify_password(&request.current_password, &auth.user.password_hash) {
        return Err(bad_request("Current password is incorrect"));
    }
    if request.new_password.len() < 6 {
        return Err(bad_request("Password must be at least 6 characters"));
    }

    state
        .users
        .update_password(&auth.user.id, &hash_password(&request.new_password))
        .await
        .map_err(|e| {
            error!("Failed to change password for {}: {}", auth.user.id, e);
            internal_error("Server error while changing password")
        })?;

    Ok(success_message("Password changed successfully"))
}

pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Value> {
    state.tokens.revoke(&auth.token);
    Ok(success_message("Logged out successfully"))
}
