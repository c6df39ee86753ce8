//! Ensures the destination table, stage and pipe exist and are usable
//! before the first record is staged.

use crate::error::{
    BootstrapSnafu, Error, IncompatiblePipeSnafu, IncompatibleStageSnafu, IncompatibleTableSnafu,
    Result,
};
use observability_deps::tracing::info;
use snafu::{ensure, ResultExt};
use warehouse::ConnectionService;

/// Which of the three objects were reused rather than created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObjectBootstrap {
    pub(crate) reused_table: bool,
    pub(crate) reused_stage: bool,
    pub(crate) reused_pipe: bool,
}

/// Check existence then compatibility for table, stage and pipe in that
/// order, creating whatever is missing. An existing but incompatible
/// object is fatal.
pub(crate) async fn ensure_table_stage_pipe(
    conn: &dyn ConnectionService,
    table: &str,
    stage: &str,
    pipe: &str,
) -> Result<ObjectBootstrap> {
    let reused_table = if conn.table_exists(table).await.context(BootstrapSnafu {
        object: format!("table {table}"),
    })? {
        ensure!(
            conn.is_table_compatible(table)
                .await
                .context(BootstrapSnafu {
                    object: format!("table {table}"),
                })?,
            IncompatibleTableSnafu { table }
        );
        info!(table, "reusing existing table");
        true
    } else {
        conn.create_table(table).await.context(BootstrapSnafu {
            object: format!("table {table}"),
        })?;
        info!(table, "created table");
        false
    };

    let reused_stage = if conn.stage_exists(stage).await.context(BootstrapSnafu {
        object: format!("stage {stage}"),
    })? {
        ensure!(
            conn.is_stage_compatible(stage)
                .await
                .context(BootstrapSnafu {
                    object: format!("stage {stage}"),
                })?,
            IncompatibleStageSnafu { stage }
        );
        info!(stage, "reusing existing stage");
        true
    } else {
        conn.create_stage(stage).await.context(BootstrapSnafu {
            object: format!("stage {stage}"),
        })?;
        info!(stage, "created stage");
        false
    };

    let reused_pipe = if conn.pipe_exists(pipe).await.context(BootstrapSnafu {
        object: format!("pipe {pipe}"),
    })? {
        ensure!(
            conn.is_pipe_compatible(pipe, table, stage)
                .await
                .context(BootstrapSnafu {
                    object: format!("pipe {pipe}"),
                })?,
            IncompatiblePipeSnafu { pipe }
        );
        info!(pipe, "reusing existing pipe");
        true
    } else {
        conn.create_pipe(pipe, table, stage)
            .await
            .context(BootstrapSnafu {
                object: format!("pipe {pipe}"),
            })?;
        info!(pipe, "created pipe");
        false
    };

    Ok(ObjectBootstrap {
        reused_table,
        reused_stage,
        reused_pipe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use warehouse::mock::MockConnection;

    #[tokio::test]
    async fn creates_all_missing_objects() {
        let conn = MockConnection::default();
        let bootstrap = ensure_table_stage_pipe(&conn, "t", "s", "p").await.unwrap();

        assert_eq!(
            bootstrap,
            ObjectBootstrap {
                reused_table: false,
                reused_stage: false,
                reused_pipe: false,
            }
        );
        assert_eq!(conn.created_tables(), vec!["t".to_string()]);
        assert_eq!(conn.created_stages(), vec!["s".to_string()]);
        assert_eq!(conn.created_pipes(), vec!["p".to_string()]);
    }

    #[tokio::test]
    async fn reuses_compatible_objects() {
        let conn = MockConnection::default();
        conn.add_existing_table("t");
        conn.add_existing_stage("s");

        let bootstrap = ensure_table_stage_pipe(&conn, "t", "s", "p").await.unwrap();

        assert_eq!(
            bootstrap,
            ObjectBootstrap {
                reused_table: true,
                reused_stage: true,
                reused_pipe: false,
            }
        );
        assert!(conn.created_tables().is_empty());
        assert_eq!(conn.created_pipes(), vec!["p".to_string()]);
    }

    #[tokio::test]
    async fn incompatible_objects_are_fatal() {
        let conn = MockConnection::default();
        conn.add_existing_table("t");
        conn.mark_table_incompatible("t");
        let err = ensure_table_stage_pipe(&conn, "t", "s", "p")
            .await
            .unwrap_err();
        assert_matches!(err, Error::IncompatibleTable { .. });
        assert_eq!(err.error_code(), Some(5003));

        let conn = MockConnection::default();
        conn.add_existing_stage("s");
        conn.mark_stage_incompatible("s");
        let err = ensure_table_stage_pipe(&conn, "t", "s", "p")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Some(5004));

        let conn = MockConnection::default();
        conn.add_existing_pipe("p");
        conn.mark_pipe_incompatible("p");
        let err = ensure_table_stage_pipe(&conn, "t", "s", "p")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Some(5005));
    }
}
