//! Record read/write contract for workspaces, their containers, forwarded
//! ports and operational logs.

use crate::error::{OrchestratorError, Result};
use crate::models::{
    parse_field, port_number, AgentStatus, ContainerStatus, CreateWorkspaceRequest,
    ForwardedPort, LogEntry, NewContainer, PortRequest, User, Workspace, WorkspaceContainer,
    WorkspaceStatus,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::{info, instrument};

fn ts(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
    log_capacity: usize,
}

impl WorkspaceStore {
    pub fn new(pool: SqlitePool, log_capacity: usize) -> Self {
        Self {
            pool,
            log_capacity: log_capacity.max(1),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- users ----

    pub async fn create_user(&self, username: &str, ssh_private_key: Option<&str>) -> Result<User> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO users (username, ssh_private_key, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(username)
        .bind(ssh_private_key)
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        self.get_user(id).await
    }

    pub async fn get_user(&self, id: i64) -> Result<User> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(User::from)
            .ok_or_else(|| OrchestratorError::NotFound(format!("user {id}")))
    }

    /// Returns the user with `username`, creating it on first sight.
    pub async fn ensure_user(&self, username: &str) -> Result<User> {
        let existing = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            Some(row) => Ok(row.into()),
            None => self.create_user(username, None).await,
        }
    }

    // ---- workspaces ----

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_workspace(&self, req: CreateWorkspaceRequest) -> Result<Workspace> {
        if req.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "workspace name must not be empty".to_string(),
            ));
        }
        if req.git_repo_url.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "git repository url must not be empty".to_string(),
            ));
        }
        self.get_user(req.user_id).await?;

        let now = Utc::now().timestamp_millis();
        let custom_config = req
            .custom_config
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO workspaces (name, user_id, workspace_type, status, git_repo_url,
                                    git_repo_config_folder, git_branch, custom_config,
                                    created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&req.name)
        .bind(req.user_id)
        .bind(req.kind.as_str())
        .bind(WorkspaceStatus::Creating.as_str())
        .bind(&req.git_repo_url)
        .bind(&req.git_repo_config_folder)
        .bind(&req.git_branch)
        .bind(serde_json::to_string(&custom_config)?)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!(workspace_id = id, "workspace created");
        self.get_workspace(id).await
    }

    pub async fn get_workspace(&self, id: i64) -> Result<Workspace> {
        sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workspace {id}")))?
            .try_into()
    }

    pub async fn list_workspaces(&self, user_id: Option<i64>) -> Result<Vec<Workspace>> {
        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();
        if user_id.is_some() {
            query.push_str(" AND user_id = ?");
        }
        query.push_str(" ORDER BY id");

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);
        if let Some(user_id) = user_id {
            q = q.bind(user_id);
        }

        q.fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Workspace::try_from)
            .collect()
    }

    pub async fn set_status(&self, id: i64, status: WorkspaceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE workspaces SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("workspace {id}")));
        }
        Ok(())
    }

    pub async fn set_config_archive(&self, id: i64, archive: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE workspaces SET config_archive = ?, updated_at = ? WHERE id = ?")
            .bind(archive)
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks the workspace running and stamps its last start.
    pub async fn mark_started(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let at = at.timestamp_millis();
        sqlx::query(
            "UPDATE workspaces
             SET status = ?, last_start_on = ?, last_activity_on = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(WorkspaceStatus::Running.as_str())
        .bind(at)
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_workspace(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM workspace_logs WHERE workspace_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("workspace {id}")));
        }
        Ok(())
    }

    // ---- operational log ----

    /// Appends one entry, evicting the oldest ones beyond the configured capacity.
    pub async fn append_log(&self, workspace_id: i64, message: &str) -> Result<()> {
        info!(workspace_id, "{message}");

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO workspace_logs (workspace_id, logged_at, message) VALUES (?, ?, ?)")
            .bind(workspace_id)
            .bind(Utc::now().timestamp_millis())
            .bind(message)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM workspace_logs
             WHERE workspace_id = ?
               AND id NOT IN (SELECT id FROM workspace_logs WHERE workspace_id = ?
                              ORDER BY id DESC LIMIT ?)",
        )
        .bind(workspace_id)
        .bind(workspace_id)
        .bind(self.log_capacity as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Log entries, oldest first.
    pub async fn logs(&self, workspace_id: i64) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, logged_at, message FROM workspace_logs WHERE workspace_id = ? ORDER BY id",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LogEntry {
                id: row.id,
                logged_at: ts(row.logged_at),
                message: row.message,
            })
            .collect())
    }

    pub async fn clear_logs(&self, workspace_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM workspace_logs WHERE workspace_id = ?")
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- containers and ports ----

    /// Inserts the container or refreshes the row with the same name.
    pub async fn upsert_container(&self, workspace_id: i64, c: &NewContainer) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO workspace_containers
                (workspace_id, container_id, container_type, name, container_user,
                 container_status, agent_status, agent_external_port,
                 can_connect_remote_developing, workspace_path_in_container,
                 external_ipv4, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (workspace_id, name) DO UPDATE SET
                container_id = excluded.container_id,
                container_type = excluded.container_type,
                container_user = excluded.container_user,
                container_status = excluded.container_status,
                agent_status = excluded.agent_status,
                agent_external_port = excluded.agent_external_port,
                can_connect_remote_developing = excluded.can_connect_remote_developing,
                workspace_path_in_container = excluded.workspace_path_in_container,
                external_ipv4 = excluded.external_ipv4
            RETURNING id
            "#,
        )
        .bind(workspace_id)
        .bind(&c.container_id)
        .bind(c.container_type.as_str())
        .bind(&c.name)
        .bind(&c.container_user)
        .bind(c.container_status.as_str())
        .bind(c.agent_status.as_str())
        .bind(i64::from(c.agent_external_port))
        .bind(c.can_connect_remote_developing)
        .bind(&c.workspace_path_in_container)
        .bind(&c.external_ipv4)
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Makes `ports` the active set of a container. Rows for ports not listed
    /// stay, inactive, so a later start republishes them under the same id.
    pub async fn activate_ports(&self, container_row_id: i64, ports: &[PortRequest]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE forwarded_ports SET active = 0 WHERE container_id = ?")
            .bind(container_row_id)
            .execute(&mut *tx)
            .await?;
        for port in ports {
            sqlx::query(
                r#"
                INSERT INTO forwarded_ports (container_id, port_number, active, connection_type, public)
                VALUES (?, ?, 1, ?, ?)
                ON CONFLICT (container_id, port_number) DO UPDATE SET
                    active = 1,
                    connection_type = excluded.connection_type,
                    public = excluded.public
                "#,
            )
            .bind(container_row_id)
            .bind(i64::from(port.port_number))
            .bind(port.connection_type.as_str())
            .bind(port.public)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_containers(&self, workspace_id: i64) -> Result<Vec<WorkspaceContainer>> {
        let rows = sqlx::query_as::<_, ContainerRow>(
            "SELECT * FROM workspace_containers WHERE workspace_id = ? ORDER BY id",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        let ports = sqlx::query_as::<_, PortRow>(
            "SELECT p.* FROM forwarded_ports p
             JOIN workspace_containers c ON c.id = p.container_id
             WHERE c.workspace_id = ?
             ORDER BY p.port_number",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        attach_ports(rows, ports)
    }

    /// Containers of workspaces currently marked running.
    pub async fn running_containers(&self) -> Result<Vec<WorkspaceContainer>> {
        let rows = sqlx::query_as::<_, ContainerRow>(
            "SELECT c.* FROM workspace_containers c
             JOIN workspaces w ON w.id = c.workspace_id
             WHERE w.status = ? AND c.container_status = ?
             ORDER BY c.id",
        )
        .bind(WorkspaceStatus::Running.as_str())
        .bind(ContainerStatus::Running.as_str())
        .fetch_all(&self.pool)
        .await?;

        attach_ports(rows, Vec::new())
    }

    pub async fn set_containers_status(
        &self,
        workspace_id: i64,
        status: ContainerStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE workspace_containers SET container_status = ? WHERE workspace_id = ?")
            .bind(status.as_str())
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_agent_status(
        &self,
        container_row_id: i64,
        status: AgentStatus,
        contacted_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workspace_containers
             SET agent_status = ?, agent_last_contact = COALESCE(?, agent_last_contact)
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(contacted_at.map(|t| t.timestamp_millis()))
        .bind(container_row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate_ports(&self, workspace_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE forwarded_ports SET active = 0
             WHERE container_id IN (SELECT id FROM workspace_containers WHERE workspace_id = ?)",
        )
        .bind(workspace_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes container rows and every forwarded port they own.
    pub async fn delete_containers(&self, workspace_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM forwarded_ports
             WHERE container_id IN (SELECT id FROM workspace_containers WHERE workspace_id = ?)",
        )
        .bind(workspace_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM workspace_containers WHERE workspace_id = ?")
            .bind(workspace_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn attach_ports(rows: Vec<ContainerRow>, ports: Vec<PortRow>) -> Result<Vec<WorkspaceContainer>> {
    let mut by_container: HashMap<i64, Vec<ForwardedPort>> = HashMap::new();
    for port in ports {
        let port = ForwardedPort::try_from(port)?;
        by_container.entry(port.container_id).or_default().push(port);
    }

    rows.into_iter()
        .map(|row| {
            let ports = by_container.remove(&row.id).unwrap_or_default();
            let mut container = WorkspaceContainer::try_from(row)?;
            container.forwarded_ports = ports;
            Ok(container)
        })
        .collect()
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    ssh_private_key: Option<String>,
    created_at: i64,
}

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: i64,
    name: String,
    user_id: i64,
    workspace_type: String,
    status: String,
    git_repo_url: String,
    git_repo_config_folder: String,
    git_branch: Option<String>,
    config_archive: Option<String>,
    custom_config: String,
    created_at: i64,
    updated_at: i64,
    last_activity_on: Option<i64>,
    last_start_on: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct ContainerRow {
    id: i64,
    workspace_id: i64,
    container_id: String,
    container_type: String,
    name: String,
    container_user: String,
    container_status: String,
    agent_status: String,
    agent_external_port: i64,
    agent_last_contact: Option<i64>,
    can_connect_remote_developing: bool,
    workspace_path_in_container: String,
    external_ipv4: String,
}

#[derive(sqlx::FromRow)]
struct PortRow {
    id: i64,
    container_id: i64,
    port_number: i64,
    active: bool,
    connection_type: String,
    public: bool,
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    logged_at: i64,
    message: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            ssh_private_key: row.ssh_private_key,
            created_at: ts(row.created_at),
        }
    }
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = OrchestratorError;

    fn try_from(row: WorkspaceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            user_id: row.user_id,
            kind: parse_field("workspace_type", &row.workspace_type)?,
            status: parse_field("status", &row.status)?,
            git_repo_url: row.git_repo_url,
            git_repo_config_folder: row.git_repo_config_folder,
            git_branch: row.git_branch,
            config_archive: row.config_archive.filter(|a| !a.is_empty()),
            custom_config: serde_json::from_str(&row.custom_config)
                .map_err(|_| OrchestratorError::invalid_field("custom_config", &row.custom_config))?,
            created_at: ts(row.created_at),
            updated_at: ts(row.updated_at),
            last_activity_on: row.last_activity_on.map(ts),
            last_start_on: row.last_start_on.map(ts),
        })
    }
}

impl TryFrom<ContainerRow> for WorkspaceContainer {
    type Error = OrchestratorError;

    fn try_from(row: ContainerRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            workspace_id: row.workspace_id,
            container_id: row.container_id,
            container_type: parse_field("container_type", &row.container_type)?,
            name: row.name,
            container_user: row.container_user,
            container_status: parse_field("container_status", &row.container_status)?,
            agent_status: parse_field("agent_status", &row.agent_status)?,
            agent_external_port: port_number("agent_external_port", row.agent_external_port)?,
            agent_last_contact: row.agent_last_contact.map(ts),
            can_connect_remote_developing: row.can_connect_remote_developing,
            workspace_path_in_container: row.workspace_path_in_container,
            external_ipv4: row.external_ipv4,
            forwarded_ports: Vec::new(),
        })
    }
}

impl TryFrom<PortRow> for ForwardedPort {
    type Error = OrchestratorError;

    fn try_from(row: PortRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            container_id: row.container_id,
            port_number: port_number("port_number", row.port_number)?,
            active: row.active,
            connection_type: parse_field("connection_type", &row.connection_type)?,
            public: row.public,
        })
    }
}
