use crate::auth::{ensure_correct_user, ensure_participant, AuthUser};
use crate::error::{AppError, AppResult};
use crate::models::*;
use crate::AppState;
use axum::{
    extract::{FromRequest, FromRequestParts, State},
    http::StatusCode,
    Json,
};

/// `Json` whose rejections come back as `AppError::Validation`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

/// `Path` whose rejections come back as `AppError::Validation`.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct AppPath<T>(pub T);

pub async fn health_check() -> &'static str {
    "OK"
}

fn require(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

pub async fn login(
    State(state): State<AppState>,
    AppJson(payload): AppJson<LoginRequest>,
) -> AppResult<Json<TokenResponse>> {
    require("username", &payload.username)?;
    require("password", &payload.password)?;

    if !state.users.authenticate(&payload.username, &payload.password).await? {
        return Err(AppError::Authentication);
    }

    let token = state.tokens.issue(&payload.username)?;
    state.users.update_login_timestamp(&payload.username).await?;
    tracing::info!(username = %payload.username, "user logged in");

    Ok(Json(TokenResponse { token }))
}

pub async fn register(
    State(state): State<AppState>,
    AppJson(payload): AppJson<RegisterRequest>,
) -> AppResult<Json<TokenResponse>> {
    require("username", &payload.username)?;
    require("password", &payload.password)?;

    let user = state
        .users
        .register(
            &payload.username,
            &payload.password,
            &payload.first_name,
            &payload.last_name,
            &payload.phone,
        )
        .await?;

    let token = state.tokens.issue(&user.username)?;
    Ok(Json(TokenResponse { token }))
}

pub async fn logout(State(state): State<AppState>, user: AuthUser) -> AppResult<StatusCode> {
    state.tokens.revoke(&user.claims).await?;
    tracing::info!(username = %user.username, "token revoked");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_users(State(state): State<AppState>, _user: AuthUser) -> AppResult<Json<UsersResponse>> {
    let users = state.users.all().await?;
    Ok(Json(UsersResponse { users }))
}

pub async fn get_user(
    State(state): State<AppState>,
    _user: AuthUser,
    AppPath(username): AppPath<String>,
) -> AppResult<Json<UserResponse>> {
    let user = state.users.get(&username).await?;
    Ok(Json(UserResponse { user }))
}

pub async fn messages_to(
    State(state): State<AppState>,
    user: AuthUser,
    AppPath(username): AppPath<String>,
) -> AppResult<Json<MessagesResponse<ReceivedMessage>>> {
    ensure_correct_user(&user, &username)?;
    let messages = state.users.messages_to(&username).await?;
    Ok(Json(MessagesResponse { messages }))
}

pub async fn messages_from(
    State(state): State<AppState>,
    user: AuthUser,
    AppPath(username): AppPath<String>,
) -> AppResult<Json<MessagesResponse<SentMessage>>> {
    ensure_correct_user(&user, &username)?;
    let messages = state.users.messages_from(&username).await?;
    Ok(Json(MessagesResponse { messages }))
}

pub async fn get_message(
    State(state): State<AppState>,
    user: AuthUser,
    AppPath(id): AppPath<i64>,
) -> AppResult<Json<MessageResponse<MessageDetail>>> {
    let message = state.messages.get(id).await?;
    ensure_participant(&user, &message.from_user.username, &message.to_user.username)?;
    Ok(Json(MessageResponse { message }))
}

pub async fn send_message(
    State(state): State<AppState>,
    user: AuthUser,
    AppJson(payload): AppJson<CreateMessageRequest>,
) -> AppResult<Json<MessageResponse<Message>>> {
    ensure_correct_user(&user, &payload.from_username)?;
    require("to_username", &payload.to_username)?;
    require("body", &payload.body)?;

    let message = state
        .messages
        .create(&payload.from_username, &payload.to_username, &payload.body)
        .await?;

    Ok(Json(MessageResponse { message }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    user: AuthUser,
    AppPath(id): AppPath<i64>,
) -> AppResult<Json<MessageResponse<ReadReceipt>>> {
    let message = state.messages.get(id).await?;
    ensure_correct_user(&user, &message.to_user.username)?;

    let message = state.messages.mark_read(id).await?;
    Ok(Json(MessageResponse { message }))
}
