//! Workflow/workbook/transition introspection persistence (C4, SPEC_FULL.md §4.4).

use serde_json::Value;

use crate::db::models::{TransitionRow, WorkbookRow, WorkflowRow};
use crate::db::snowflake;
use crate::db::DbPool;
use crate::error::AppResult;
use crate::playbook::types::{NextSpec, Playbook};

/// Persist `workflow`, `workbook`, `transition` rows for a freshly planned
/// execution. Best-effort introspection only — never read back by the
/// broker, which re-parses the catalog entry on every evaluation.
pub async fn persist_plan_rows(
    pool: &DbPool,
    execution_id: i64,
    catalog_id: i64,
    playbook: &Playbook,
) -> AppResult<()> {
    for step in &playbook.workflow {
        let workflow_id = snowflake::generate(pool).await?;
        let config = serde_json::json!({
            "args": step.args,
            "when": step.when,
            "loop": step.r#loop,
            "tool": step.tool,
        });
        insert_workflow_row(pool, workflow_id, execution_id, catalog_id, &step.step, &step.tool.kind.to_string(), &config).await?;

        let targets: Vec<(String, Option<String>)> = match &step.next {
            Some(NextSpec::Single(s)) => vec![(s.clone(), None)],
            Some(NextSpec::List(list)) => list.iter().map(|s| (s.clone(), None)).collect(),
            Some(NextSpec::Targets(targets)) => targets
                .iter()
                .map(|t| (t.step.clone(), t.when.clone()))
                .collect(),
            None => Vec::new(),
        };
        for (to_step, when_expr) in targets {
            let transition_id = snowflake::generate(pool).await?;
            insert_transition_row(
                pool,
                transition_id,
                execution_id,
                catalog_id,
                &step.step,
                &to_step,
                when_expr.as_deref(),
            )
            .await?;
        }
    }

    if let Some(workbook) = &playbook.workbook {
        for task in workbook {
            let workbook_id = snowflake::generate(pool).await?;
            let config = serde_json::json!({ "tool": task.tool, "save": task.save });
            insert_workbook_row(
                pool,
                workbook_id,
                execution_id,
                catalog_id,
                &task.name,
                &task.tool.kind.to_string(),
                &config,
            )
            .await?;
        }
    }

    Ok(())
}

async fn insert_workflow_row(
    pool: &DbPool,
    workflow_id: i64,
    execution_id: i64,
    catalog_id: i64,
    step_name: &str,
    tool_kind: &str,
    config: &Value,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.workflow (
            workflow_id, execution_id, catalog_id, step_name, tool_kind, config, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, now())
        "#,
    )
    .bind(workflow_id)
    .bind(execution_id)
    .bind(catalog_id)
    .bind(step_name)
    .bind(tool_kind)
    .bind(config)
    .execute(pool)
    .await?;
    Ok(())
}

async fn insert_workbook_row(
    pool: &DbPool,
    workbook_id: i64,
    execution_id: i64,
    catalog_id: i64,
    task_name: &str,
    tool_kind: &str,
    config: &Value,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.workbook (
            workbook_id, execution_id, catalog_id, task_name, tool_kind, config, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, now())
        "#,
    )
    .bind(workbook_id)
    .bind(execution_id)
    .bind(catalog_id)
    .bind(task_name)
    .bind(tool_kind)
    .bind(config)
    .execute(pool)
    .await?;
    Ok(())
}

async fn insert_transition_row(
    pool: &DbPool,
    transition_id: i64,
    execution_id: i64,
    catalog_id: i64,
    from_step: &str,
    to_step: &str,
    when_expr: Option<&str>,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.transition (
            transition_id, execution_id, catalog_id, from_step, to_step, when_expr, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, now())
        "#,
    )
    .bind(transition_id)
    .bind(execution_id)
    .bind(catalog_id)
    .bind(from_step)
    .bind(to_step)
    .bind(when_expr)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_workflow_rows(pool: &DbPool, execution_id: i64) -> AppResult<Vec<WorkflowRow>> {
    let rows = sqlx::query_as::<_, WorkflowRow>(
        "SELECT workflow_id, execution_id, catalog_id, step_name, tool_kind, config, created_at FROM noetl.workflow WHERE execution_id = $1 ORDER BY workflow_id ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_workbook_rows(pool: &DbPool, execution_id: i64) -> AppResult<Vec<WorkbookRow>> {
    let rows = sqlx::query_as::<_, WorkbookRow>(
        "SELECT workbook_id, execution_id, catalog_id, task_name, tool_kind, config, created_at FROM noetl.workbook WHERE execution_id = $1 ORDER BY workbook_id ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_transition_rows(pool: &DbPool, execution_id: i64) -> AppResult<Vec<TransitionRow>> {
    let rows = sqlx::query_as::<_, TransitionRow>(
        "SELECT transition_id, execution_id, catalog_id, from_step, to_step, when_expr, created_at FROM noetl.transition WHERE execution_id = $1 ORDER BY transition_id ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
