//! One-shot playbook planning (C4, SPEC_FULL.md §4.4).
//!
//! `Planner::plan` runs once per execution, triggered by the broker's
//! reaction to `execution_started` (`WorkflowBroker::dispatch_start`, not a
//! standalone request path — the API handler only emits `execution_started`;
//! planning happens on the broker's reactive dispatch of that event so the
//! whole lifecycle stays event-triggered). It persists the `workflow` /
//! `workbook` / `transition` introspection rows and emits
//! `workflow_initialized`, then hands the parsed playbook back to the broker
//! to identify and enter the first actionable step.
//!
//! Planning is guarded against re-entry: if `workflow_initialized` already
//! exists for the execution (possible since `EventService::notify` re-fires
//! listeners against a parent execution's latest event, which may still be
//! `execution_started` the second time a child wakes it), `plan` is a no-op
//! that just returns the already-parsed playbook.

use crate::db::models::CatalogEntryRequest;
use crate::db::queries::plan::persist_plan_rows;
use crate::db::snowflake;
use crate::db::DbPool;
use crate::error::AppResult;
use crate::playbook::parser;
use crate::playbook::types::{NextSpec, Playbook};
use crate::services::{CatalogService, EventService};

pub struct Planner {
    pool: DbPool,
    catalog: CatalogService,
    events: EventService,
}

impl Planner {
    pub fn new(pool: DbPool, catalog: CatalogService, events: EventService) -> Self {
        Self {
            pool,
            catalog,
            events,
        }
    }

    /// Load the catalog entry for `catalog_id`, parse and validate it
    /// (`InvalidPlaybook` surfaces as `AppError::Validation`), and — unless
    /// already planned — persist workflow/workbook/transition rows and emit
    /// `workflow_initialized` with `parent_event_id` set to the triggering
    /// `execution_started` event.
    pub async fn plan(
        &self,
        execution_id: i64,
        catalog_id: i64,
        execution_started_event_id: i64,
    ) -> AppResult<Playbook> {
        let entry = self
            .catalog
            .get_resource(CatalogEntryRequest {
                catalog_id: Some(catalog_id.to_string()),
                path: None,
                version: None,
            })
            .await?;
        let playbook = parser::parse_playbook(&entry.content)?;

        let already_planned = self
            .events
            .get_latest_event(execution_id, Some("workflow_initialized"))
            .await?
            .is_some();
        if already_planned {
            return Ok(playbook);
        }

        persist_plan_rows(&self.pool, execution_id, catalog_id, &playbook).await?;

        let transition_count: i32 = playbook
            .workflow
            .iter()
            .map(|step| match &step.next {
                Some(NextSpec::Single(_)) => 1,
                Some(NextSpec::List(list)) => list.len() as i32,
                Some(NextSpec::Targets(targets)) => targets.len() as i32,
                None => 0,
            })
            .sum();

        let event_id = snowflake::generate(&self.pool).await?;
        self.events
            .emit_workflow_initialized(
                event_id,
                execution_id,
                catalog_id,
                execution_started_event_id,
                playbook.workflow.len() as i32,
                transition_count,
            )
            .await?;

        Ok(playbook)
    }
}
