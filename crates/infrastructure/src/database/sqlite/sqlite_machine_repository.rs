use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};
use tuna_core::models::{Machine, NewMachine};
use tuna_core::traits::MachineRepository;
use tuna_core::{TunaError, TunaResult};

const MACHINE_COLUMNS: &str = "id, hostname, address, ssh_port, ssh_user, arch, num_cu, gpu_count, \
     power_address, available, unreachable, host_failures, updated_at";

pub struct SqliteMachineRepository {
    pool: SqlitePool,
}

impl SqliteMachineRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_machine(row: &sqlx::sqlite::SqliteRow) -> TunaResult<Machine> {
        Ok(Machine {
            id: row.try_get("id")?,
            hostname: row.try_get("hostname")?,
            address: row.try_get("address")?,
            ssh_port: row.try_get("ssh_port")?,
            ssh_user: row.try_get("ssh_user")?,
            arch: row.try_get("arch")?,
            num_cu: row.try_get("num_cu")?,
            gpu_count: row.try_get("gpu_count")?,
            power_address: row.try_get("power_address")?,
            available: row.try_get("available")?,
            unreachable: row.try_get("unreachable")?,
            host_failures: row.try_get("host_failures")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn update_flag(&self, id: i64, column: &str, value: bool) -> TunaResult<()> {
        let sql = format!("UPDATE machine SET {column} = $1, updated_at = $2 WHERE id = $3");
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TunaError::MachineNotFound { id });
        }

        debug!("更新机器 {} 的 {} 为 {}", id, column, value);
        Ok(())
    }
}

#[async_trait]
impl MachineRepository for SqliteMachineRepository {
    #[instrument(skip(self, machine), fields(hostname = %machine.hostname))]
    async fn create(&self, machine: &NewMachine) -> TunaResult<Machine> {
        let sql = format!(
            r#"
            INSERT INTO machine (hostname, address, ssh_port, ssh_user, arch, num_cu, gpu_count,
                                 power_address, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {MACHINE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&machine.hostname)
            .bind(&machine.address)
            .bind(machine.ssh_port)
            .bind(&machine.ssh_user)
            .bind(&machine.arch)
            .bind(machine.num_cu)
            .bind(machine.gpu_count)
            .bind(&machine.power_address)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;

        let created = Self::row_to_machine(&row)?;
        debug!("登记机器成功: ID {}, 主机 {}", created.id, created.hostname);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> TunaResult<Option<Machine>> {
        let sql = format!("SELECT {MACHINE_COLUMNS} FROM machine WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::row_to_machine(&row)).transpose()
    }

    async fn get_by_hostname(&self, hostname: &str) -> TunaResult<Option<Machine>> {
        let sql = format!("SELECT {MACHINE_COLUMNS} FROM machine WHERE hostname = $1");
        let row = sqlx::query(&sql)
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::row_to_machine(&row)).transpose()
    }

    async fn list(&self) -> TunaResult<Vec<Machine>> {
        let sql = format!("SELECT {MACHINE_COLUMNS} FROM machine ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_machine).collect()
    }

    async fn list_allocatable(&self) -> TunaResult<Vec<Machine>> {
        let sql = format!(
            "SELECT {MACHINE_COLUMNS} FROM machine WHERE available = 1 AND unreachable = 0 ORDER BY id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_machine).collect()
    }

    async fn set_available(&self, id: i64, available: bool) -> TunaResult<()> {
        self.update_flag(id, "available", available).await
    }

    async fn set_unreachable(&self, id: i64, unreachable: bool) -> TunaResult<()> {
        if unreachable {
            warn!("机器 {} 被标记为不可达", id);
        }
        self.update_flag(id, "unreachable", unreachable).await
    }

    async fn record_host_failure(&self, id: i64) -> TunaResult<i32> {
        let failures: Option<i32> = sqlx::query_scalar(
            "UPDATE machine SET host_failures = host_failures + 1, updated_at = $1 WHERE id = $2 RETURNING host_failures",
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        failures.ok_or(TunaError::MachineNotFound { id })
    }

    async fn clear_host_failures(&self, id: i64) -> TunaResult<()> {
        sqlx::query("UPDATE machine SET host_failures = 0, updated_at = $1 WHERE id = $2 AND host_failures <> 0")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
