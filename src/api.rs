use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::error::LibError;
use crate::models::{
    CreatePersonPayload, Detail, EditPersonPayload, ErrorEnvelope, ListPersonsQuery, PersonId,
    Removed,
};

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if self.0.kind.is_internal() {
            tracing::error!(kind = ?self.0.kind, error = ?self.0.source, "pedigree api request failed");
        } else {
            tracing::debug!(kind = ?self.0.kind, code = self.0.code, error = %self.0.source, "pedigree api request rejected");
        }
        (status, Json(ErrorEnvelope::from_error(&self.0))).into_response()
    }
}

fn rejected(public: &'static str, rejection: impl std::fmt::Display) -> AppError {
    AppError(LibError::bad_request(public, anyhow!("{}", rejection)))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|err| rejected("Invalid request body", err.body_text()))
}

fn path<T>(params: Result<Path<T>, PathRejection>) -> Result<T, AppError> {
    params
        .map(|Path(value)| value)
        .map_err(|err| rejected("Invalid person identifier", err.body_text()))
}

fn detail<T: Serialize>(value: T) -> Json<Detail<T>> {
    Json(Detail { detail: value })
}

pub trait HasPool {
    fn pool(&self) -> Arc<SqlitePool>;
}

pub trait PedigreeApp: HasPool {}

async fn health_handler<S>(State(app): State<S>) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let store = db::ping(&app.pool()).await?;
    Ok(detail(serde_json::json!({ "status": "ok", "store": store })))
}

async fn create_person_handler<S>(
    State(app): State<S>,
    payload: Result<Json<CreatePersonPayload>, JsonRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let person = db::create_person(&app.pool(), body(payload)?).await?;
    Ok((StatusCode::CREATED, detail(person)))
}

async fn list_persons_handler<S>(
    State(app): State<S>,
    query: Result<Query<ListPersonsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let Query(query) = query.map_err(|err| rejected("Invalid query string", err.body_text()))?;
    let page = db::list_persons(&app.pool(), query).await?;
    Ok(detail(page))
}

async fn get_person_handler<S>(
    State(app): State<S>,
    person_id: Result<Path<PersonId>, PathRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let person = db::get_person(&app.pool(), path(person_id)?).await?;
    Ok(detail(person))
}

async fn edit_person_handler<S>(
    State(app): State<S>,
    person_id: Result<Path<PersonId>, PathRejection>,
    payload: Result<Json<EditPersonPayload>, JsonRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let person = db::edit_person(&app.pool(), path(person_id)?, body(payload)?).await?;
    Ok(detail(person))
}

async fn delete_person_handler<S>(
    State(app): State<S>,
    person_id: Result<Path<PersonId>, PathRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let person = db::delete_person(&app.pool(), path(person_id)?).await?;
    Ok(detail(person))
}

async fn get_parents_handler<S>(
    State(app): State<S>,
    child_id: Result<Path<PersonId>, PathRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let parents = db::get_parents(&app.pool(), path(child_id)?).await?;
    Ok(detail(parents))
}

async fn link_parent_handler<S>(
    State(app): State<S>,
    ids: Result<Path<(PersonId, PersonId)>, PathRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let (child_id, parent_id) = path(ids)?;
    let link = db::link_parent(&app.pool(), child_id, parent_id).await?;
    Ok((StatusCode::CREATED, detail(link)))
}

async fn unlink_parent_handler<S>(
    State(app): State<S>,
    ids: Result<Path<(PersonId, PersonId)>, PathRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let (child_id, parent_id) = path(ids)?;
    let removed = db::unlink_parent(&app.pool(), child_id, parent_id).await?;
    Ok(detail(Removed { removed }))
}

async fn get_spouses_handler<S>(
    State(app): State<S>,
    person_id: Result<Path<PersonId>, PathRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let spouses = db::get_spouses(&app.pool(), path(person_id)?).await?;
    Ok(detail(spouses))
}

async fn link_spouse_handler<S>(
    State(app): State<S>,
    ids: Result<Path<(PersonId, PersonId)>, PathRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let (person_id, spouse_id) = path(ids)?;
    let link = db::link_spouse(&app.pool(), person_id, spouse_id).await?;
    Ok((StatusCode::CREATED, detail(link)))
}

async fn unlink_spouse_handler<S>(
    State(app): State<S>,
    ids: Result<Path<(PersonId, PersonId)>, PathRejection>,
) -> Result<impl IntoResponse, AppError>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    let (person_id, spouse_id) = path(ids)?;
    let removed = db::unlink_spouse(&app.pool(), person_id, spouse_id).await?;
    Ok(detail(Removed { removed }))
}

pub fn routes<S>() -> Router<S>
where
    S: PedigreeApp + Clone + Send + Sync + 'static,
{
    tracing::info!("Registering route /healthz [GET]");
    tracing::info!("Registering route /people [GET,POST]");
    tracing::info!("Registering route /people/{{person_id}} [GET,PUT,DELETE]");
    tracing::info!("Registering route /people/{{person_id}}/parents [GET]");
    tracing::info!("Registering route /people/{{person_id}}/parents/{{parent_id}} [PUT,DELETE]");
    tracing::info!("Registering route /people/{{person_id}}/spouses [GET]");
    tracing::info!("Registering route /people/{{person_id}}/spouses/{{spouse_id}} [PUT,DELETE]");

    Router::new()
        .route("/healthz", get(health_handler::<S>))
        .route(
            "/people",
            get(list_persons_handler::<S>).post(create_person_handler::<S>),
        )
        .route(
            "/people/{person_id}",
            get(get_person_handler::<S>)
                .put(edit_person_handler::<S>)
                .delete(delete_person_handler::<S>),
        )
        .route("/people/{person_id}/parents", get(get_parents_handler::<S>))
        .route(
            "/people/{person_id}/parents/{parent_id}",
            put(link_parent_handler::<S>).delete(unlink_parent_handler::<S>),
        )
        .route("/people/{person_id}/spouses", get(get_spouses_handler::<S>))
        .route(
            "/people/{person_id}/spouses/{spouse_id}",
            put(link_spouse_handler::<S>).delete(unlink_spouse_handler::<S>),
        )
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::db::tests::test_pool;

    #[derive(Clone)]
    struct TestApp {
        pool: Arc<SqlitePool>,
    }

    impl HasPool for TestApp {
        fn pool(&self) -> Arc<SqlitePool> {
            Arc::clone(&self.pool)
        }
    }

    impl PedigreeApp for TestApp {}

    async fn app() -> Router {
        let pool = test_pool().await;
        routes::<TestApp>().with_state(TestApp {
            pool: Arc::new(pool),
        })
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request should build");

        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("body should be json")
        };
        (status, value)
    }

    async fn create(app: &Router, name: &str, sex: &str) -> String {
        let (status, body) = send(
            app,
            Method::POST,
            "/people",
            Some(json!({"name": name, "sex": sex, "isAlive": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["detail"]["id"]
            .as_str()
            .expect("created person should have an id")
            .to_string()
    }

    #[tokio::test]
    async fn healthz_reports_store() {
        let app = app().await;
        let (status, body) = send(&app, Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["status"], "ok");
    }

    #[tokio::test]
    async fn person_crud_round_trip() {
        let app = app().await;
        let id = create(&app, "Ana", "female").await;

        let (status, body) = send(&app, Method::GET, &format!("/people/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["name"], "Ana");
        assert_eq!(body["detail"]["birthDate"], Value::Null);

        let (status, body) = send(
            &app,
            Method::PUT,
            &format!("/people/{}", id),
            Some(json!({"birthDate": "1990-04-12"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["birthDate"], "1990-04-12");

        let (status, body) = send(&app, Method::DELETE, &format!("/people/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["id"], id.as_str());

        let (status, body) = send(&app, Method::GET, &format!("/people/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn malformed_requests_are_bad_requests() {
        let app = app().await;

        let (status, body) = send(&app, Method::GET, "/people/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, _) = send(
            &app,
            Method::POST,
            "/people",
            Some(json!({"name": "Ana", "sex": "other", "isAlive": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::GET, "/people?sortBy=birthDate", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, Method::GET, "/people?pageSize=500", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["message"], "pageSize must be between 1 and 100");
    }

    #[tokio::test]
    async fn parent_routes_enforce_rules() {
        let app = app().await;
        let child = create(&app, "Child", "female").await;
        let p1 = create(&app, "P1", "female").await;
        let p2 = create(&app, "P2", "male").await;
        let p3 = create(&app, "P3", "male").await;

        let uri = |parent: &str| format!("/people/{}/parents/{}", child, parent);

        let (status, body) = send(&app, Method::PUT, &uri(&p1), None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["detail"]["parentCount"], 1);

        let (status, body) = send(&app, Method::PUT, &uri(&p1), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");

        let (status, _) = send(&app, Method::PUT, &uri(&p2), None).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, Method::PUT, &uri(&p3), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["violation"], "parent_limit_exceeded");

        let (status, body) = send(&app, Method::DELETE, &uri(&p1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["removed"], 1);

        let (status, body) = send(
            &app,
            Method::GET,
            &format!("/people/{}/parents", child),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["parents"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn spouse_routes_match_either_direction() {
        let app = app().await;
        let a = create(&app, "A", "female").await;
        let b = create(&app, "B", "male").await;

        let (status, _) = send(&app, Method::PUT, &format!("/people/{}/spouses/{}", a, b), None).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(&app, Method::PUT, &format!("/people/{}/spouses/{}", b, a), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, Method::GET, &format!("/people/{}/spouses", b), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["spouses"][0]["id"], a.as_str());

        let (status, body) = send(&app, Method::PUT, &format!("/people/{}/spouses/{}", a, a), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["violation"], "self_spouse");
    }

    #[tokio::test]
    async fn list_route_wraps_page_in_detail() {
        let app = app().await;
        create(&app, "Ana", "female").await;
        create(&app, "Leo", "male").await;

        let (status, body) = send(
            &app,
            Method::GET,
            "/people?sex=female&isAlive=true&pageSize=10&sortBy=name&sortDir=asc",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["pagination"]["total"], 1);
        assert_eq!(body["detail"]["pagination"]["pageSize"], 10);
        assert_eq!(body["detail"]["data"][0]["name"], "Ana");

        let (status, body) = send(
            &app,
            Method::GET,
            "/people?createdAt_from=2000-01-01&createdAt_to=2999-12-31",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"]["pagination"]["total"], 2);
    }
}
