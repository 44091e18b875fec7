//! PostgreSQL implementation of [`Store`] on a sqlx pool.
//!
//! Controls are announced with `pg_notify(<channel>, <pod>)` in the same
//! transaction as the inbox upsert, so a listener never sees a pod before
//! its control is visible.

use super::{ControlNotifications, ControlSession, DbError, Store};
use crate::config::{DatabaseConfig, DatabaseConnection};
use crate::modbus::ModbusEndpoint;
use crate::model::{
    Control, ControlId, ControlPlant, EnvironmentSample, EnvironmentSensor, EssRef, EssSample,
    EssState, EssTemperature, EssUnit, HeartbeatPolicy, PendingControl, PlantId, PlantSample,
    SendLogEntry, Stats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Opens a pool from the configuration.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, DbError> {
    let options = match config
        .connection()
        .map_err(|e| DbError::Configuration(e.to_string()))?
    {
        DatabaseConnection::Url(url) => url.parse::<PgConnectOptions>()?,
        DatabaseConnection::Parts {
            host,
            port,
            name,
            user,
            password,
        } => {
            let options = PgConnectOptions::new()
                .host(&host)
                .port(port)
                .database(&name)
                .username(&user);
            match password {
                Some(password) => options.password(&password),
                None => options,
            }
        }
    };

    info!(max_connections = config.max_connections, "Creating PostgreSQL connection pool");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Applies the embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    notify_channel: String,
}

impl PgStore {
    pub fn new(pool: PgPool, notify_channel: impl Into<String>) -> Self {
        Self {
            pool,
            notify_channel: notify_channel.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn endpoint(
    table: &'static str,
    host: String,
    port: i32,
    unit_id: i32,
) -> Result<ModbusEndpoint, DbError> {
    let port = u16::try_from(port).map_err(|_| DbError::InvalidRow {
        table,
        reason: format!("port {port} out of range"),
    })?;
    let unit_id = u8::try_from(unit_id).map_err(|_| DbError::InvalidRow {
        table,
        reason: format!("slave id {unit_id} out of range"),
    })?;
    Ok(ModbusEndpoint::new(host, port, unit_id))
}

#[derive(sqlx::FromRow)]
struct ControlPlantRow {
    plant_id: i32,
    pod_id: String,
    name: String,
    ip_address: String,
    port: i32,
    logger_slave_id: i32,
    logger_manufacturer: String,
    ess_id: Option<i32>,
    ess_slave_id: Option<i32>,
    ess_manufacturer: Option<String>,
    ess_model: Option<String>,
}

#[derive(sqlx::FromRow)]
struct EssUnitRow {
    id: i32,
    plant_id: i32,
    ip_address: String,
    port: i32,
    slave_id: i32,
    manufacturer: String,
    model: Option<String>,
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    id: i32,
    ip_address: String,
    port: i32,
    slave_id: i32,
}

#[derive(sqlx::FromRow)]
struct PlantSampleRow {
    plant_id: i32,
    pod_id: String,
    measured_at: DateTime<Utc>,
    sum_active_power: Option<f64>,
    cos_phi: Option<f64>,
    available_power_min: Option<f64>,
    available_power_max: Option<f64>,
    reference_power: Option<f64>,
    ghi: Option<f64>,
    panel_temp: Option<f64>,
}

impl From<PlantSampleRow> for PlantSample {
    fn from(row: PlantSampleRow) -> Self {
        Self {
            plant_id: row.plant_id,
            pod_id: row.pod_id,
            measured_at: row.measured_at,
            sum_active_power: row.sum_active_power,
            cos_phi: row.cos_phi,
            available_power_min: row.available_power_min,
            available_power_max: row.available_power_max,
            reference_power: row.reference_power,
            ghi: row.ghi,
            panel_temp: row.panel_temp,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EssSampleRow {
    plant_id: i32,
    measured_at: DateTime<Utc>,
    avg_batt_temp: Option<f64>,
    min_batt_temp: Option<f64>,
    max_batt_temp: Option<f64>,
    avg_container_temp: Option<f64>,
    min_container_temp: Option<f64>,
    max_container_temp: Option<f64>,
    available_capacity_charge: f64,
    available_capacity_discharge: f64,
    average_current_soc: Option<f64>,
    allowed_min_soc: f64,
    allowed_max_soc: f64,
}

impl TryFrom<EssSampleRow> for EssSample {
    type Error = DbError;

    fn try_from(row: EssSampleRow) -> Result<Self, DbError> {
        Ok(Self {
            plant_id: row.plant_id,
            measured_at: row.measured_at,
            battery_temp: Stats {
                avg: row.avg_batt_temp,
                min: row.min_batt_temp,
                max: row.max_batt_temp,
            },
            container_temp: Stats {
                avg: row.avg_container_temp,
                min: row.min_container_temp,
                max: row.max_container_temp,
            },
            available_capacity_charge: row.available_capacity_charge,
            available_capacity_discharge: row.available_capacity_discharge,
            average_current_soc: row.average_current_soc.ok_or(DbError::InvalidRow {
                table: "ess_data_term1",
                reason: "average_current_soc is null".to_string(),
            })?,
            allowed_min_soc: row.allowed_min_soc,
            allowed_max_soc: row.allowed_max_soc,
        })
    }
}

type StatsRow = (Option<f64>, Option<f64>, Option<f64>);

fn stats((avg, min, max): StatsRow) -> Stats {
    Stats { avg, min, max }
}

#[async_trait]
impl Store for PgStore {
    async fn control_plants(&self) -> Result<Vec<ControlPlant>, DbError> {
        let rows: Vec<ControlPlantRow> = sqlx::query_as(
            r#"
            SELECT
                p.id AS plant_id,
                p.pod_id,
                p.name,
                p.ip_address,
                p.port,
                p.logger_slave_id,
                p.logger_manufacturer,
                e.id AS ess_id,
                e.slave_id AS ess_slave_id,
                e.manufacturer AS ess_manufacturer,
                e.model AS ess_model
            FROM plants p
            LEFT JOIN ess_units e ON e.plant_id = p.id AND e.active = TRUE
            WHERE p.alteo_api_control = TRUE
            ORDER BY p.id, e.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut plants: BTreeMap<PlantId, ControlPlant> = BTreeMap::new();
        for row in rows {
            if !plants.contains_key(&row.plant_id) {
                let logger = endpoint("plants", row.ip_address, row.port, row.logger_slave_id)?;
                plants.insert(
                    row.plant_id,
                    ControlPlant {
                        id: row.plant_id,
                        pod_id: row.pod_id,
                        name: row.name,
                        logger,
                        logger_manufacturer: row.logger_manufacturer,
                        ess_units: Vec::new(),
                    },
                );
            }
            if let (Some(id), Some(slave_id), Some(plant)) =
                (row.ess_id, row.ess_slave_id, plants.get_mut(&row.plant_id))
            {
                plant.ess_units.push(EssRef {
                    id,
                    slave_id: u8::try_from(slave_id).map_err(|_| DbError::InvalidRow {
                        table: "ess_units",
                        reason: format!("slave id {slave_id} out of range"),
                    })?,
                    manufacturer: row.ess_manufacturer.unwrap_or_default(),
                    model: row.ess_model,
                });
            }
        }
        Ok(plants.into_values().collect())
    }

    async fn active_ess_units(&self) -> Result<Vec<EssUnit>, DbError> {
        let rows: Vec<EssUnitRow> = sqlx::query_as(
            r#"
            SELECT id, plant_id, ip_address, port, slave_id, manufacturer, model
            FROM ess_units
            WHERE active = TRUE
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(EssUnit {
                    id: row.id,
                    plant_id: row.plant_id,
                    endpoint: endpoint("ess_units", row.ip_address, row.port, row.slave_id)?,
                    manufacturer: row.manufacturer,
                    model: row.model,
                })
            })
            .collect()
    }

    async fn active_environment_sensors(&self) -> Result<Vec<EnvironmentSensor>, DbError> {
        let rows: Vec<SensorRow> = sqlx::query_as(
            "SELECT id, ip_address, port, slave_id FROM environment_sensors WHERE active = TRUE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(EnvironmentSensor {
                    id: row.id,
                    endpoint: endpoint(
                        "environment_sensors",
                        row.ip_address,
                        row.port,
                        row.slave_id,
                    )?,
                })
            })
            .collect()
    }

    async fn active_pods(&self) -> Result<Vec<String>, DbError> {
        let pods = sqlx::query_scalar(
            "SELECT DISTINCT pod_id FROM plants WHERE alteo_api_control = TRUE ORDER BY pod_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(pods)
    }

    async fn insert_plant_samples(&self, samples: &[PlantSample]) -> Result<u64, DbError> {
        if samples.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO plant_data_term1 (plant_id, pod_id, measured_at, sum_active_power, \
             cos_phi, available_power_min, available_power_max, reference_power, ghi, panel_temp) ",
        );
        builder.push_values(samples, |mut row, s| {
            row.push_bind(s.plant_id)
                .push_bind(s.pod_id.clone())
                .push_bind(s.measured_at)
                .push_bind(s.sum_active_power)
                .push_bind(s.cos_phi)
                .push_bind(s.available_power_min)
                .push_bind(s.available_power_max)
                .push_bind(s.reference_power)
                .push_bind(s.ghi)
                .push_bind(s.panel_temp);
        });
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_ess_sample(&self, sample: &EssSample) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO ess_data_term1 (
                plant_id, measured_at,
                avg_batt_temp, min_batt_temp, max_batt_temp,
                avg_container_temp, min_container_temp, max_container_temp,
                available_capacity_charge, available_capacity_discharge,
                average_current_soc, allowed_min_soc, allowed_max_soc
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(sample.plant_id)
        .bind(sample.measured_at)
        .bind(sample.battery_temp.avg)
        .bind(sample.battery_temp.min)
        .bind(sample.battery_temp.max)
        .bind(sample.container_temp.avg)
        .bind(sample.container_temp.min)
        .bind(sample.container_temp.max)
        .bind(sample.available_capacity_charge)
        .bind(sample.available_capacity_discharge)
        .bind(sample.average_current_soc)
        .bind(sample.allowed_min_soc)
        .bind(sample.allowed_max_soc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_environment_sample(
        &self,
        sample: &EnvironmentSample,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO environment_data_term1 (sensor_id, measured_at, temperature)
            VALUES ($1, $2, $3)
            ON CONFLICT (sensor_id, measured_at) DO NOTHING
            "#,
        )
        .bind(sample.sensor_id)
        .bind(sample.measured_at)
        .bind(sample.temperature)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn latest_plant_measurements(&self) -> Result<Vec<PlantSample>, DbError> {
        let rows: Vec<PlantSampleRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (p.id)
                p.id AS plant_id,
                p.pod_id,
                pd.measured_at,
                pd.sum_active_power,
                pd.cos_phi,
                pd.available_power_min,
                pd.available_power_max,
                pd.reference_power,
                pd.ghi,
                pd.panel_temp
            FROM plants p
            JOIN plant_data_term1 pd ON pd.plant_id = p.id
            WHERE p.alteo_api_control = TRUE
            ORDER BY p.id, pd.measured_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PlantSample::from).collect())
    }

    async fn latest_ess_sample(&self, plant_id: PlantId) -> Result<Option<EssSample>, DbError> {
        let row: Option<EssSampleRow> = sqlx::query_as(
            r#"
            SELECT plant_id, measured_at,
                   avg_batt_temp, min_batt_temp, max_batt_temp,
                   avg_container_temp, min_container_temp, max_container_temp,
                   available_capacity_charge, available_capacity_discharge,
                   average_current_soc, allowed_min_soc, allowed_max_soc
            FROM ess_data_term1
            WHERE plant_id = $1
            ORDER BY measured_at DESC
            LIMIT 1
            "#,
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EssSample::try_from).transpose()
    }

    async fn environment_window_stats(
        &self,
        plant_id: PlantId,
        window: Duration,
    ) -> Result<Stats, DbError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT AVG(e.temperature), MIN(e.temperature), MAX(e.temperature)
            FROM environment_data_term1 e
            JOIN plant_environment_sensors pes ON pes.sensor_id = e.sensor_id
            WHERE pes.plant_id = $1
              AND e.measured_at >= NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(plant_id)
        .bind(window.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        Ok(stats(row))
    }

    async fn ess_window_stats(
        &self,
        plant_id: PlantId,
        column: EssTemperature,
        window: Duration,
    ) -> Result<Stats, DbError> {
        // the column name comes from a closed enum, never from input
        let sql = format!(
            "SELECT AVG({col}), MIN({col}), MAX({col}) FROM ess_data_term1 \
             WHERE plant_id = $1 AND measured_at >= NOW() - make_interval(secs => $2)",
            col = column.column()
        );
        let row: StatsRow = sqlx::query_as(&sql)
            .bind(plant_id)
            .bind(window.as_secs_f64())
            .fetch_one(&self.pool)
            .await?;
        Ok(stats(row))
    }

    async fn last_heartbeat(&self, pod: &str) -> Result<Option<i64>, DbError> {
        let heartbeat: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT heartbeat FROM alteo_controls_inbox WHERE pod = $1 ORDER BY received_at DESC LIMIT 1",
        )
        .bind(pod)
        .fetch_optional(&self.pool)
        .await?;
        Ok(heartbeat.flatten())
    }

    async fn record_controls(
        &self,
        controls: &[Control],
        policy: HeartbeatPolicy,
    ) -> Result<Vec<String>, DbError> {
        let guard = match policy {
            HeartbeatPolicy::Monotonic => {
                "WHERE alteo_controls_inbox.heartbeat IS NULL \
                 OR alteo_controls_inbox.heartbeat < EXCLUDED.heartbeat"
            }
            HeartbeatPolicy::Overwrite => "",
        };
        let sql = format!(
            "INSERT INTO alteo_controls_inbox \
                 (pod, heartbeat, sum_setpoint, scheduled_reference, usesetpoint) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (pod) DO UPDATE SET \
                 heartbeat = EXCLUDED.heartbeat, \
                 sum_setpoint = EXCLUDED.sum_setpoint, \
                 scheduled_reference = EXCLUDED.scheduled_reference, \
                 usesetpoint = EXCLUDED.usesetpoint, \
                 received_at = NOW(), \
                 applied = FALSE, \
                 applied_at = NULL, \
                 applied_value = NULL, \
                 note = NULL \
             {guard}"
        );

        let mut replaced = Vec::new();
        let mut tx = self.pool.begin().await?;
        for control in controls {
            let result = sqlx::query(&sql)
                .bind(&control.pod)
                .bind(control.heartbeat)
                .bind(control.sum_set_point)
                .bind(control.scheduled_reference)
                .bind(control.use_set_point)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(&self.notify_channel)
                    .bind(&control.pod)
                    .execute(&mut *tx)
                    .await?;
                replaced.push(control.pod.clone());
            } else {
                debug!(pod = %control.pod, heartbeat = ?control.heartbeat, "Stale heartbeat ignored");
            }
        }
        tx.commit().await?;
        Ok(replaced)
    }

    async fn store_send_log(&self, entry: &SendLogEntry) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO alteo_send_log (pod, request_json, response_json, status_code)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&entry.pod)
        .bind(Json(&entry.request))
        .bind(Json(&entry.response))
        .bind(i32::from(entry.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn control_session(&self) -> Result<Box<dyn ControlSession>, DbError> {
        let conn = self.pool.acquire().await?.detach();
        Ok(Box::new(PgControlSession { conn }))
    }

    async fn control_notifications(
        &self,
        channel: &str,
    ) -> Result<Box<dyn ControlNotifications>, DbError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        info!(channel, "Listening for controls");
        Ok(Box::new(PgNotifications { listener }))
    }
}

/// Control executor connection, detached from the pool so session state
/// (advisory locks, open transaction) stays on one backend.
struct PgControlSession {
    conn: PgConnection,
}

#[derive(sqlx::FromRow)]
struct EssStateRow {
    ip_address: String,
    port: i32,
    slave_id: i32,
    average_current_soc: Option<f64>,
    available_capacity_charge: f64,
    available_capacity_discharge: f64,
}

#[async_trait]
impl ControlSession for PgControlSession {
    async fn try_lock(&mut self, pod: &str) -> Result<bool, DbError> {
        let locked = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(pod)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(locked)
    }

    async fn unlock(&mut self, pod: &str) -> Result<(), DbError> {
        sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(pod)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        sqlx::query("BEGIN")
            .execute(&mut self.conn)
            .await
            .map_err(|e| DbError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        sqlx::query("COMMIT")
            .execute(&mut self.conn)
            .await
            .map_err(|e| DbError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        sqlx::query("ROLLBACK")
            .execute(&mut self.conn)
            .await
            .map_err(|e| DbError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn latest_unapplied_control(
        &mut self,
        pod: &str,
    ) -> Result<Option<PendingControl>, DbError> {
        let row: Option<(ControlId, Option<f64>)> = sqlx::query_as(
            r#"
            SELECT id, sum_setpoint
            FROM alteo_controls_inbox
            WHERE pod = $1 AND applied = FALSE
            ORDER BY received_at DESC
            LIMIT 1
            "#,
        )
        .bind(pod)
        .fetch_optional(&mut self.conn)
        .await?;
        Ok(row.map(|(id, target_kw)| PendingControl { id, target_kw }))
    }

    async fn latest_plant_power(&mut self, pod: &str) -> Result<Option<f64>, DbError> {
        let power: Option<Option<f64>> = sqlx::query_scalar(
            "SELECT sum_active_power FROM plant_data_term1 WHERE pod_id = $1 ORDER BY measured_at DESC LIMIT 1",
        )
        .bind(pod)
        .fetch_optional(&mut self.conn)
        .await?;
        Ok(power.flatten())
    }

    async fn latest_ess_state(&mut self, pod: &str) -> Result<Option<EssState>, DbError> {
        let row: Option<EssStateRow> = sqlx::query_as(
            r#"
            SELECT
                e.ip_address,
                e.port,
                e.slave_id,
                d.average_current_soc,
                d.available_capacity_charge,
                d.available_capacity_discharge
            FROM ess_data_term1 d
            JOIN ess_units e ON e.plant_id = d.plant_id AND e.active = TRUE
            JOIN plants p ON p.id = d.plant_id
            WHERE p.pod_id = $1
            ORDER BY d.measured_at DESC, e.id
            LIMIT 1
            "#,
        )
        .bind(pod)
        .fetch_optional(&mut self.conn)
        .await?;

        row.map(|row| {
            Ok(EssState {
                endpoint: endpoint("ess_units", row.ip_address, row.port, row.slave_id)?,
                soc: row.average_current_soc,
                capacity_charge: row.available_capacity_charge,
                capacity_discharge: row.available_capacity_discharge,
            })
        })
        .transpose()
    }

    async fn mark_applied(
        &mut self,
        id: ControlId,
        applied_kw: Option<f64>,
        note: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE alteo_controls_inbox
            SET applied = TRUE, applied_at = NOW(), applied_value = $1, note = $2
            WHERE id = $3
            "#,
        )
        .bind(applied_kw)
        .bind(note)
        .bind(id)
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }
}

struct PgNotifications {
    listener: PgListener,
}

#[async_trait]
impl ControlNotifications for PgNotifications {
    async fn next_pod(&mut self, wait: Duration) -> Result<Option<String>, DbError> {
        match tokio::time::timeout(wait, self.listener.recv()).await {
            Err(_) => Ok(None),
            Ok(notification) => Ok(Some(notification?.payload().to_string())),
        }
    }
}
