use crate::{
    api::{event_utils::Event, sites::SitePathArgs, ApiState},
    http_error, storage,
};
use anyhow::Result;
use dropshot::{endpoint, HttpError, HttpResponseOk, Path, Query, RequestContext};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListEventsQueryArgs {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListEventsResponse {
    /// Events for the site, oldest first.
    pub events: Vec<Event>,
}

/// List a site's events.
///
/// Every accepted deploy, step entered, completion and failure is recorded here in order.
#[endpoint(
    method = GET,
    path = "/api/sites/{site_id}/events",
    tags = ["Events"],
)]
pub async fn list_site_events(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<SitePathArgs>,
    query_params: Query<ListEventsQueryArgs>,
) -> Result<HttpResponseOk<ListEventsResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let query = query_params.into_inner();

    let mut conn = match api_state.storage.read_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    if let Err(e) = storage::sites::get(&mut conn, &path.site_id).await {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    format!("site '{}' does not exist", path.site_id),
                ));
            }
            _ => {
                return Err(http_error!(
                    "Could not get object from database",
                    rqctx.request_id,
                    Some(e.into())
                ));
            }
        }
    }

    let storage_events = match storage::events::list_by_site(
        &mut conn,
        &path.site_id,
        query.offset.unwrap_or_default() as i64,
        query.limit.unwrap_or(100) as i64,
    )
    .await
    {
        Ok(events) => events,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                rqctx.request_id,
                Some(e.into())
            ));
        }
    };

    let mut events: Vec<Event> = vec![];

    for storage_event in storage_events {
        let event = Event::try_from(storage_event).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                rqctx.request_id,
                Some(e)
            )
        })?;

        events.push(event);
    }

    Ok(HttpResponseOk(ListEventsResponse { events }))
}
