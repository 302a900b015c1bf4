//! HTTP surface.
//!
//! Handlers resolve the caller through [`AuthenticatedUser`], validate the
//! request body at the boundary and delegate to the ledger services. Every
//! failure is rendered by [`LedgerError`]'s `ResponseError` impl.

use std::sync::Arc;

use actix_web::{get, post, put, web, HttpResponse};
use futures::TryStreamExt;
use serde::Deserialize;

use crate::auth::AuthenticatedUser;
use crate::balance::{BalanceEngine, PairBalance};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{ExpenseRecord, Ledger, NewExpense, UserTransaction};
use crate::schemas::{Amount, ExpenseId, Group, GroupId, SplitId, User, UserId};
use crate::settlement::SettlementCoordinator;
use crate::store::LedgerStore;

const MAX_DESCRIPTION_LEN: usize = 256;

/// Services shared by every worker.
pub struct AppState {
    pub ledger: Ledger,
    pub coordinator: SettlementCoordinator,
}

impl AppState {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        let balances = Arc::new(BalanceEngine::new(store.clone()));
        Self {
            ledger: Ledger::new(store.clone(), balances.clone()),
            coordinator: SettlementCoordinator::new(store, balances),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct NameJson {
    name: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ExpenseJson {
    group_id: GroupId,
    payer_id: UserId,
    amount: Amount,
    participant_ids: Vec<UserId>,
    #[serde(default)]
    description: String,
}

fn clean_description(raw: &str) -> LedgerResult<String> {
    let description = raw.trim().to_string();
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(LedgerError::InvalidRequest(format!(
            "description longer than {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(description)
}

impl ExpenseJson {
    fn into_new_expense(self) -> LedgerResult<NewExpense> {
        let description = clean_description(&self.description)?;
        Ok(NewExpense {
            group_id: self.group_id,
            payer: self.payer_id,
            amount: self.amount,
            participants: self.participant_ids,
            description,
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FriendExpenseJson {
    amount: Amount,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SettleJson {
    requested_by: UserId,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LeaveJson {
    user_id: UserId,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MembersJson {
    user_ids: Vec<UserId>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct OweDetailsQuery {
    user_id: UserId,
}

// Acting on behalf of someone else is never allowed.
fn require_self(caller: &AuthenticatedUser, claimed: &UserId) -> LedgerResult<()> {
    if &caller.0 == claimed {
        Ok(())
    } else {
        Err(LedgerError::Forbidden)
    }
}

async fn require_member(
    state: &AppState,
    group: &GroupId,
    caller: &AuthenticatedUser,
) -> LedgerResult<Group> {
    let group = state.ledger.group(group).await?;
    if group.is_member(&caller.0) {
        Ok(group)
    } else {
        Err(LedgerError::Forbidden)
    }
}

#[put("/users/{id}")]
#[tracing::instrument(skip(state, json))]
async fn put_user(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<UserId>,
    json: web::Json<NameJson>,
) -> LedgerResult<HttpResponse> {
    let id = id.into_inner();
    require_self(&caller, &id)?;
    let user = state.ledger.register_user(id, json.into_inner().name).await?;
    Ok(HttpResponse::Ok().json(user))
}

#[get("/users/{id}/groups")]
#[tracing::instrument(skip(state))]
async fn get_user_groups(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<UserId>,
) -> LedgerResult<HttpResponse> {
    require_self(&caller, &id)?;
    let groups = state.ledger.user_groups(&id).try_collect::<Vec<Group>>().await?;
    Ok(HttpResponse::Ok().json(groups))
}

#[get("/users/{id}/transactions")]
#[tracing::instrument(skip(state))]
async fn get_user_transactions(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<UserId>,
) -> LedgerResult<HttpResponse> {
    require_self(&caller, &id)?;
    let transactions = state
        .ledger
        .user_transactions(&id)
        .try_collect::<Vec<UserTransaction>>()
        .await?;
    Ok(HttpResponse::Ok().json(transactions))
}

#[put("/groups/{id}")]
#[tracing::instrument(skip(state, json))]
async fn put_group(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
    json: web::Json<NameJson>,
) -> LedgerResult<HttpResponse> {
    let group = state
        .ledger
        .create_group(id.into_inner(), json.into_inner().name, caller.0)
        .await?;
    Ok(HttpResponse::Created().json(group))
}

#[get("/groups/potential")]
#[tracing::instrument(skip(state))]
async fn get_joinable_groups(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
) -> LedgerResult<HttpResponse> {
    let groups = state
        .ledger
        .joinable_groups(&caller.0)
        .try_collect::<Vec<Group>>()
        .await?;
    Ok(HttpResponse::Ok().json(groups))
}

#[get("/groups/{id}")]
#[tracing::instrument(skip(state))]
async fn get_group(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
) -> LedgerResult<HttpResponse> {
    require_member(&state, &id, &caller).await?;
    Ok(HttpResponse::Ok().json(state.ledger.group_summary(&id).await?))
}

#[get("/groups/{id}/available-users")]
#[tracing::instrument(skip(state))]
async fn get_available_users(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
) -> LedgerResult<HttpResponse> {
    require_member(&state, &id, &caller).await?;
    let users = state
        .ledger
        .users_outside_group(&id)
        .try_collect::<Vec<User>>()
        .await?;
    Ok(HttpResponse::Ok().json(users))
}

#[post("/groups/{id}/members")]
#[tracing::instrument(skip(state, json))]
async fn post_members(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
    json: web::Json<MembersJson>,
) -> LedgerResult<HttpResponse> {
    require_member(&state, &id, &caller).await?;
    let group = state.ledger.add_members(&id, &json.user_ids).await?;
    Ok(HttpResponse::Ok().json(group))
}

#[post("/groups/{id}/join")]
#[tracing::instrument(skip(state))]
async fn post_join(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
) -> LedgerResult<HttpResponse> {
    let group = state.ledger.join_group(&id, &caller.0).await?;
    Ok(HttpResponse::Ok().json(group))
}

#[post("/groups/{id}/leave")]
#[tracing::instrument(skip(state, json))]
async fn post_leave(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
    json: web::Json<LeaveJson>,
) -> LedgerResult<HttpResponse> {
    require_self(&caller, &json.user_id)?;
    let group = state.coordinator.leave_group(&id, &json.user_id).await?;
    Ok(HttpResponse::Ok().json(group))
}

#[get("/groups/{id}/expenses")]
#[tracing::instrument(skip(state))]
async fn get_group_expenses(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
) -> LedgerResult<HttpResponse> {
    require_member(&state, &id, &caller).await?;
    let expenses = state
        .ledger
        .group_expenses(&id)
        .try_collect::<Vec<ExpenseRecord>>()
        .await?;
    Ok(HttpResponse::Ok().json(expenses))
}

#[get("/groups/{id}/balances")]
#[tracing::instrument(skip(state))]
async fn get_balances(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
) -> LedgerResult<HttpResponse> {
    require_member(&state, &id, &caller).await?;
    let balances = state.ledger.group_balances(&id).await?;
    Ok(HttpResponse::Ok().json(balances.pairs().collect::<Vec<PairBalance>>()))
}

#[get("/groups/{id}/owe-details")]
#[tracing::instrument(skip(state))]
async fn get_owe_details(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
    query: web::Query<OweDetailsQuery>,
) -> LedgerResult<HttpResponse> {
    require_member(&state, &id, &caller).await?;
    let details = state.ledger.owe_details(&id, &query.user_id).await?;
    Ok(HttpResponse::Ok().json(details))
}

#[get("/groups/{id}/suggested-settlements")]
#[tracing::instrument(skip(state))]
async fn get_suggested_settlements(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<GroupId>,
) -> LedgerResult<HttpResponse> {
    require_member(&state, &id, &caller).await?;
    Ok(HttpResponse::Ok().json(state.ledger.suggested_settlements(&id).await?))
}

#[post("/expenses")]
#[tracing::instrument(skip(state, json))]
async fn post_expense(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    json: web::Json<ExpenseJson>,
) -> LedgerResult<HttpResponse> {
    let request = json.into_inner().into_new_expense()?;
    require_member(&state, &request.group_id, &caller).await?;
    let record = state.ledger.record_expense(request).await?;
    Ok(HttpResponse::Created().json(record))
}

#[get("/expenses/{id}")]
#[tracing::instrument(skip(state))]
async fn get_expense(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<ExpenseId>,
) -> LedgerResult<HttpResponse> {
    let record = state.ledger.expense(&id).await?;
    require_member(&state, &record.expense.group_id, &caller).await?;
    Ok(HttpResponse::Ok().json(record))
}

#[post("/friends/{id}/expenses")]
#[tracing::instrument(skip(state, json))]
async fn post_friend_expense(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<UserId>,
    json: web::Json<FriendExpenseJson>,
) -> LedgerResult<HttpResponse> {
    let FriendExpenseJson { amount, description } = json.into_inner();
    let record = state
        .ledger
        .record_direct_expense(caller.0, id.into_inner(), amount, clean_description(&description)?)
        .await?;
    Ok(HttpResponse::Created().json(record))
}

#[get("/friends/{id}/expenses")]
#[tracing::instrument(skip(state))]
async fn get_friend_expenses(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<UserId>,
) -> LedgerResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.ledger.direct_expenses(&caller.0, &id).await?))
}

#[put("/splits/{id}/settle")]
#[tracing::instrument(skip(state, json))]
async fn put_settle(
    state: web::Data<AppState>,
    caller: AuthenticatedUser,
    id: web::Path<SplitId>,
    json: web::Json<SettleJson>,
) -> LedgerResult<HttpResponse> {
    require_self(&caller, &json.requested_by)?;
    let result = state.coordinator.settle(&id, &json.requested_by).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// Registers every route together with JSON/query error handlers that
/// render extractor failures as `invalid_request`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _| {
        LedgerError::InvalidRequest(err.to_string()).into()
    }))
    .app_data(web::QueryConfig::default().error_handler(|err, _| {
        LedgerError::InvalidRequest(err.to_string()).into()
    }))
    .service(put_user)
    .service(get_user_groups)
    .service(get_user_transactions)
    .service(put_group)
    // Before `/groups/{id}` so that "potential" is not taken for an id.
    .service(get_joinable_groups)
    .service(get_group)
    .service(get_available_users)
    .service(post_members)
    .service(post_join)
    .service(post_leave)
    .service(get_group_expenses)
    .service(get_balances)
    .service(get_owe_details)
    .service(get_suggested_settlements)
    .service(post_expense)
    .service(get_expense)
    .service(post_friend_expense)
    .service(get_friend_expenses)
    .service(put_settle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionKey;
    use crate::store::InMemoryLedgerStore;
    use actix_web::{
        body::MessageBody,
        dev::{Service, ServiceResponse},
        http::{header::AUTHORIZATION, StatusCode},
        test, App,
    };
    use serde_json::{json, Value};

    const SECRET: &str = "test-session-secret";

    fn token(user: &str) -> (actix_web::http::header::HeaderName, String) {
        (AUTHORIZATION, SessionKey::new(SECRET).issue(&UserId::from(user)))
    }

    async fn app() -> impl Service<actix_http::Request, Response = ServiceResponse<impl MessageBody>, Error = actix_web::Error>
    {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(store)))
                .app_data(web::Data::new(SessionKey::new(SECRET)))
                .configure(configure),
        )
        .await
    }

    async fn send<S, B>(app: &S, as_user: &str, req: test::TestRequest) -> (StatusCode, Value)
    where
        S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
        B: MessageBody,
    {
        let resp = test::call_service(app, req.insert_header(token(as_user)).to_request()).await;
        let status = resp.status();
        let body = test::read_body(resp).await;
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    /// Users a, b and c; group "trip" created by a with b and c added.
    async fn trip<S, B>(app: &S)
    where
        S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
        B: MessageBody,
    {
        for id in ["a", "b", "c"] {
            let req = test::TestRequest::put()
                .uri(&format!("/users/{id}"))
                .set_json(json!({ "name": id.to_uppercase() }));
            assert_eq!(send(app, id, req).await.0, StatusCode::OK);
        }
        let req = test::TestRequest::put()
            .uri("/groups/trip")
            .set_json(json!({ "name": "Trip" }));
        assert_eq!(send(app, "a", req).await.0, StatusCode::CREATED);
        let req = test::TestRequest::post()
            .uri("/groups/trip/members")
            .set_json(json!({ "userIds": ["b", "c"] }));
        assert_eq!(send(app, "a", req).await.0, StatusCode::OK);
    }

    fn dinner() -> test::TestRequest {
        test::TestRequest::post().uri("/expenses").set_json(json!({
            "groupId": "trip",
            "payerId": "a",
            "amount": 100,
            "participantIds": ["a", "b", "c"],
            "description": "dinner",
        }))
    }

    fn split_of(record: &Value, debtor: &str) -> String {
        record["splits"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["debtor"] == debtor)
            .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[actix_web::test]
    async fn requests_without_token_are_rejected() {
        let app = app().await;
        let req = test::TestRequest::get().uri("/groups/trip/balances").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "unauthenticated");
    }

    #[actix_web::test]
    async fn expense_settle_and_leave() {
        let app = app().await;
        trip(&app).await;

        let (status, record) = send(&app, "a", dinner()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record["splits"].as_array().unwrap().len(), 3);
        assert_eq!(record["settled"], false);

        let req = test::TestRequest::get().uri("/groups/trip/balances");
        let (status, balances) = send(&app, "c", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            balances,
            json!([
                { "debtor": "b", "creditor": "a", "amount": 33 },
                { "debtor": "c", "creditor": "a", "amount": 33 },
            ])
        );

        let settle = |by: &str| {
            test::TestRequest::put()
                .uri(&format!("/splits/{}/settle", split_of(&record, "b")))
                .set_json(json!({ "requestedBy": by }))
        };
        let (status, first) = send(&app, "b", settle("b")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "settled");
        assert_eq!(first["balance"]["amount"], 0);

        let (status, second) = send(&app, "a", settle("a")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["status"], "already_settled");
        assert_eq!(second["settlement"], first["settlement"]);

        let leave = |user: &str| {
            test::TestRequest::post()
                .uri("/groups/trip/leave")
                .set_json(json!({ "userId": user }))
        };
        let (status, body) = send(&app, "a", leave("a")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "outstanding_balance");

        let (status, group) = send(&app, "b", leave("b")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(group["members"], json!(["a", "c"]));
    }

    #[actix_web::test]
    async fn nobody_acts_for_someone_else() {
        let app = app().await;
        trip(&app).await;
        let (_, record) = send(&app, "a", dinner()).await;
        let uri = format!("/splits/{}/settle", split_of(&record, "b"));

        // c is neither debtor nor creditor of b's split.
        let req = test::TestRequest::put()
            .uri(&uri)
            .set_json(json!({ "requestedBy": "c" }));
        assert_eq!(send(&app, "c", req).await.0, StatusCode::FORBIDDEN);

        // c claiming to be b.
        let req = test::TestRequest::put()
            .uri(&uri)
            .set_json(json!({ "requestedBy": "b" }));
        assert_eq!(send(&app, "c", req).await.0, StatusCode::FORBIDDEN);

        let req = test::TestRequest::get().uri("/users/b/transactions");
        assert_eq!(send(&app, "c", req).await.0, StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn non_members_cannot_read_the_group() {
        let app = app().await;
        trip(&app).await;
        let req = test::TestRequest::put()
            .uri("/users/d")
            .set_json(json!({ "name": "D" }));
        send(&app, "d", req).await;

        let req = test::TestRequest::get().uri("/groups/trip");
        assert_eq!(send(&app, "d", req).await.0, StatusCode::FORBIDDEN);

        let req = test::TestRequest::post().uri("/groups/trip/join");
        assert_eq!(send(&app, "d", req).await.0, StatusCode::OK);
        let req = test::TestRequest::post().uri("/groups/trip/join");
        assert_eq!(send(&app, "d", req).await.0, StatusCode::CONFLICT);

        let req = test::TestRequest::get().uri("/groups/trip");
        let (status, summary) = send(&app, "d", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["members"].as_array().unwrap().len(), 4);
    }

    #[actix_web::test]
    async fn bad_bodies_are_validation_errors() {
        let app = app().await;
        trip(&app).await;

        let req = test::TestRequest::post().uri("/expenses").set_json(json!({
            "groupId": "trip",
            "payerId": "a",
            "amount": 0,
            "participantIds": ["a"],
        }));
        let (status, body) = send(&app, "a", req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_amount");

        let req = test::TestRequest::post().uri("/expenses").set_json(json!({
            "groupId": "trip",
            "payerId": "a",
            "amount": 10,
            "participantIds": [],
        }));
        assert_eq!(send(&app, "a", req).await.1["error"], "empty_participants");

        let req = test::TestRequest::post().uri("/expenses").set_json(json!({
            "groupId": "trip",
            "payerId": "a",
            "amount": "ten",
            "participantIds": ["a"],
        }));
        let (status, body) = send(&app, "a", req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let req = test::TestRequest::put()
            .uri("/groups/trip")
            .set_json(json!({ "name": "Again" }));
        assert_eq!(send(&app, "a", req).await.0, StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn read_side_reflects_expenses() {
        let app = app().await;
        trip(&app).await;
        let (_, record) = send(&app, "a", dinner()).await;

        let req = test::TestRequest::get().uri("/groups/trip/owe-details?userId=c");
        let (status, details) = send(&app, "c", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(details, json!([{ "creditor": "a", "creditor_name": "A", "amount": 33 }]));

        let req = test::TestRequest::get().uri("/groups/trip/suggested-settlements");
        let (_, suggestions) = send(&app, "b", req).await;
        assert_eq!(suggestions.as_array().unwrap().len(), 2);

        let req = test::TestRequest::get().uri("/groups/trip/expenses");
        let (_, expenses) = send(&app, "b", req).await;
        assert_eq!(expenses[0]["id"], record["id"]);

        let req = test::TestRequest::get().uri(&format!("/expenses/{}", record["id"].as_str().unwrap()));
        let (status, fetched) = send(&app, "c", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["description"], "dinner");

        let req = test::TestRequest::get().uri("/users/b/transactions");
        let (_, transactions) = send(&app, "b", req).await;
        assert_eq!(transactions.as_array().unwrap().len(), 1);

        let req = test::TestRequest::get().uri("/users/a/groups");
        let (_, groups) = send(&app, "a", req).await;
        assert_eq!(groups[0]["id"], "trip");
    }

    #[actix_web::test]
    async fn invitations_and_discovery() {
        let app = app().await;
        trip(&app).await;
        let req = test::TestRequest::put()
            .uri("/users/d")
            .set_json(json!({ "name": "D" }));
        send(&app, "d", req).await;

        let req = test::TestRequest::get().uri("/groups/trip/available-users");
        let (status, users) = send(&app, "a", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(users, json!([{ "id": "d", "name": "D" }]));

        let req = test::TestRequest::get().uri("/groups/trip/available-users");
        assert_eq!(send(&app, "d", req).await.0, StatusCode::FORBIDDEN);

        let req = test::TestRequest::get().uri("/groups/potential");
        let (status, groups) = send(&app, "d", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(groups[0]["id"], "trip");

        let req = test::TestRequest::post().uri("/groups/trip/join");
        assert_eq!(send(&app, "d", req).await.0, StatusCode::OK);
        let req = test::TestRequest::get().uri("/groups/potential");
        assert_eq!(send(&app, "d", req).await.1, json!([]));
    }

    #[actix_web::test]
    async fn friend_expenses_settle_through_splits() {
        let app = app().await;
        trip(&app).await;

        let req = test::TestRequest::post()
            .uri("/friends/b/expenses")
            .set_json(json!({ "amount": 40, "description": "taxi" }));
        let (status, record) = send(&app, "a", req).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record["splits"].as_array().unwrap().len(), 1);
        assert_eq!(record["splits"][0]["amount"], 40);

        let req = test::TestRequest::get().uri("/friends/a/expenses");
        let (status, expenses) = send(&app, "b", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(expenses[0]["id"], record["id"]);

        let req = test::TestRequest::get().uri("/users/b/groups");
        let (_, groups) = send(&app, "b", req).await;
        assert_eq!(groups.as_array().unwrap().len(), 1);

        let req = test::TestRequest::put()
            .uri(&format!("/splits/{}/settle", split_of(&record, "b")))
            .set_json(json!({ "requestedBy": "b" }));
        let (status, outcome) = send(&app, "b", req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["status"], "settled");

        let req = test::TestRequest::post()
            .uri("/friends/a/expenses")
            .set_json(json!({ "amount": 10 }));
        assert_eq!(send(&app, "a", req).await.0, StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/friends/c/expenses")
            .set_json(json!({ "amount": 1_000_000_000_001i64 }));
        let (status, body) = send(&app, "a", req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_amount");
    }
}
