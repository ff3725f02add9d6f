// Operator endpoints.

use axum::{extract::State, routing::post, Form, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{ErrorCode, RelayError};
use crate::store::EntityStore;
use crate::users;

#[derive(Debug, Deserialize)]
pub struct NewUserForm {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
}

pub(crate) fn router(store: EntityStore) -> Router {
    Router::new().route("/admin/new-user", post(new_user)).with_state(store)
}

async fn new_user(
    State(store): State<EntityStore>,
    Form(form): Form<NewUserForm>,
) -> Result<&'static str, RelayError> {
    let id = required(form.id, "id")?;
    let pass = required(form.pass, "pass")?;

    users::create_user(&store, &id, &pass).await?;
    info!(user_id = %id, "user created");
    Ok("success")
}

fn required(value: Option<String>, field: &'static str) -> Result<String, RelayError> {
    value.filter(|value| !value.trim().is_empty()).ok_or_else(|| {
        RelayError::new(ErrorCode::ValidationFailed, format!("missing form field `{field}`"))
            .with_details(json!({ "field": field }))
    })
}
