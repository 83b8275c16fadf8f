//! [`SqliteStore`] — the SQLite implementation of the Tally store traits.
//!
//! Counter mutations are expressed as guarded single-statement updates
//! (`UPDATE ... WHERE used < quota`) so the quota ceiling is enforced by the
//! database itself; callers never lock. Creation races resolve through the
//! composite unique index on `usage_records`.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use tally_core::{
  limits::LimitSnapshot,
  plan::{DurationUnit, NewPlan, Plan},
  store::{
    InsertOutcome, PlanInsertOutcome, PlanStore, RegisterOutcome,
    SubscriptionStore, UsageStore,
  },
  subscription::{
    NewSubscription, PlanRef, SubscriptionInstance, subscription_end,
  },
  usage::{BonusStamp, UsageKey, UsageRecord, WindowMeta},
  window::Window,
};

use crate::{
  Error, Result,
  encode::{
    RawInstance, RawPlan, RawUsageRecord, encode_count, encode_function_key,
    encode_plan_status, encode_ts, encode_uuid,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Tally store backed by a single SQLite file.
///
/// Cloning is cheap — the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Row mapping and key binding ─────────────────────────────────────────────

const USAGE_COLUMNS: &str = "instance_id, subject_id, module_key, \
   function_key, window_type, window_unit, window_size, window_start, \
   window_end, used, quota, last_bonus_at, bonus_source, bonus_expires_at";

fn usage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawUsageRecord> {
  Ok(RawUsageRecord {
    instance_id:      row.get(0)?,
    subject_id:       row.get(1)?,
    module_key:       row.get(2)?,
    function_key:     row.get(3)?,
    window_type:      row.get(4)?,
    window_unit:      row.get(5)?,
    window_size:      row.get(6)?,
    window_start:     row.get(7)?,
    window_end:       row.get(8)?,
    used:             row.get(9)?,
    quota:            row.get(10)?,
    last_bonus_at:    row.get(11)?,
    bonus_source:     row.get(12)?,
    bonus_expires_at: row.get(13)?,
  })
}

fn instance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawInstance> {
  Ok(RawInstance {
    instance_id:   row.get(0)?,
    subject_id:    row.get(1)?,
    plan_id:       row.get(2)?,
    name:          row.get(3)?,
    price:         row.get(4)?,
    duration:      row.get(5)?,
    duration_unit: row.get(6)?,
    limits_json:   row.get(7)?,
    start_at:      row.get(8)?,
    end_at:        row.get(9)?,
    status:        row.get(10)?,
    created_at:    row.get(11)?,
  })
}

const INSTANCE_COLUMNS: &str = "instance_id, subject_id, plan_id, name, \
   price, duration, duration_unit, limits_json, start_at, end_at, status, \
   created_at";

fn plan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawPlan> {
  Ok(RawPlan {
    plan_id:       row.get(0)?,
    name:          row.get(1)?,
    code:          row.get(2)?,
    price:         row.get(3)?,
    description:   row.get(4)?,
    duration:      row.get(5)?,
    duration_unit: row.get(6)?,
    limits_json:   row.get(7)?,
    status:        row.get(8)?,
    created_at:    row.get(9)?,
  })
}

const PLAN_COLUMNS: &str = "plan_id, name, code, price, description, \
   duration, duration_unit, limits_json, status, created_at";

/// Pre-encoded bind values for a composite usage key. `function_coalesced`
/// feeds the `COALESCE(function_key, '')` predicate; `function` is the
/// nullable column value on insert.
#[derive(Clone)]
struct KeyParams {
  instance:           String,
  subject:            String,
  module:             String,
  function:           Option<String>,
  function_coalesced: String,
  start:              i64,
  end:                i64,
}

impl KeyParams {
  fn from_key(key: &UsageKey) -> Self {
    Self {
      instance:           encode_uuid(key.instance_id),
      subject:            encode_uuid(key.subject_id),
      module:             key.module_key.clone(),
      function:           key.function_key.clone(),
      function_coalesced: encode_function_key(key.function_key.as_deref()),
      start:              encode_ts(key.window.start),
      end:                encode_ts(key.window.end),
    }
  }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
  matches!(
    e,
    rusqlite::Error::SqliteFailure(f, _)
      if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
  )
}

// ─── PlanStore impl ──────────────────────────────────────────────────────────

impl PlanStore for SqliteStore {
  type Error = Error;

  async fn add_plan(&self, input: NewPlan) -> Result<PlanInsertOutcome> {
    let plan = Plan {
      plan_id:       Uuid::new_v4(),
      name:          input.name,
      code:          input.code,
      price:         input.price,
      description:   input.description,
      duration:      input.duration,
      duration_unit: input.duration_unit,
      limits:        input.limits,
      status:        input.status,
      created_at:    Utc::now(),
    };

    let id_str      = encode_uuid(plan.plan_id);
    let name        = plan.name.clone();
    let code        = plan.code.clone();
    let price       = plan.price;
    let description = plan.description.clone();
    let duration    = i64::from(plan.duration);
    let unit        = plan.duration_unit.as_str().to_owned();
    let limits_json = plan.limits.to_json().map_err(Error::Core)?;
    let status      = encode_plan_status(plan.status).to_owned();
    let created_at  = encode_ts(plan.created_at);

    let inserted: bool = self
      .conn
      .call(move |conn| {
        let result = conn.execute(
          "INSERT INTO plans (
             plan_id, name, code, price, description,
             duration, duration_unit, limits_json, status, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
          rusqlite::params![
            id_str,
            name,
            code,
            price,
            description,
            duration,
            unit,
            limits_json,
            status,
            created_at,
          ],
        );
        match result {
          Ok(_) => Ok(true),
          Err(e) if is_unique_violation(&e) => Ok(false),
          Err(e) => Err(e.into()),
        }
      })
      .await?;

    if inserted {
      Ok(PlanInsertOutcome::Created(plan))
    } else {
      Ok(PlanInsertOutcome::CodeExists)
    }
  }

  async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>> {
    let id_str = encode_uuid(plan_id);

    let raw: Option<RawPlan> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {PLAN_COLUMNS} FROM plans WHERE plan_id = ?1"),
              rusqlite::params![id_str],
              plan_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawPlan::into_plan).transpose()
  }

  async fn find_plan_by_code(&self, code: &str) -> Result<Option<Plan>> {
    let code = code.to_owned();

    let raw: Option<RawPlan> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {PLAN_COLUMNS} FROM plans WHERE code = ?1"),
              rusqlite::params![code],
              plan_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawPlan::into_plan).transpose()
  }

  async fn list_plans(&self) -> Result<Vec<Plan>> {
    let raws: Vec<RawPlan> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {PLAN_COLUMNS} FROM plans ORDER BY created_at"
        ))?;
        let rows = stmt
          .query_map([], plan_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawPlan::into_plan).collect()
  }

  async fn update_plan_limits(
    &self,
    plan_id: Uuid,
    limits: LimitSnapshot,
  ) -> Result<Option<Plan>> {
    let id_str = encode_uuid(plan_id);
    let limits_json = limits.to_json().map_err(Error::Core)?;

    let updated: usize = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE plans SET limits_json = ?2 WHERE plan_id = ?1",
          rusqlite::params![id_str, limits_json],
        )?)
      })
      .await?;

    if updated == 0 {
      return Ok(None);
    }
    self.get_plan(plan_id).await
  }
}

// ─── SubscriptionStore impl ──────────────────────────────────────────────────

impl SubscriptionStore for SqliteStore {
  type Error = Error;

  async fn register(&self, input: NewSubscription) -> Result<RegisterOutcome> {
    let plan = match &input.plan {
      PlanRef::ById(id) => self.get_plan(*id).await?,
      PlanRef::ByCode(code) => self.find_plan_by_code(code).await?,
    };
    let Some(plan) = plan else {
      return Ok(RegisterOutcome::PlanNotFound);
    };

    let start_at = input.start_at.unwrap_or_else(Utc::now);
    let duration_unit = input.duration_unit.unwrap_or(plan.duration_unit);
    // Lifetime registrations ignore duration and any override.
    let duration = if duration_unit == DurationUnit::Lifetime {
      0
    } else {
      input.duration_override.unwrap_or(plan.duration)
    };
    let end_at =
      subscription_end(start_at, duration, duration_unit).map_err(Error::Core)?;

    let instance = SubscriptionInstance {
      instance_id: Uuid::new_v4(),
      subject_id: input.subject_id,
      plan_id: plan.plan_id,
      name: plan.name.clone(),
      price: plan.price,
      duration,
      duration_unit,
      // The snapshot: an owned copy, fixed at registration time.
      limits: plan.limits.clone(),
      start_at,
      end_at,
      status: tally_core::subscription::InstanceStatus::Active,
      created_at: Utc::now(),
    };

    let id_str      = encode_uuid(instance.instance_id);
    let subject_str = encode_uuid(instance.subject_id);
    let plan_str    = encode_uuid(instance.plan_id);
    let name        = instance.name.clone();
    let price       = instance.price;
    let dur         = i64::from(instance.duration);
    let unit        = instance.duration_unit.as_str().to_owned();
    let limits_json = instance.limits.to_json().map_err(Error::Core)?;
    let start_ms    = encode_ts(instance.start_at);
    let end_ms      = encode_ts(instance.end_at);
    let status      = instance.status.as_str().to_owned();
    let created_ms  = encode_ts(instance.created_at);
    let replace     = input.replace_current;

    // Overlap handling and the insert are one transaction: nobody ever
    // observes two overlapping active instances for a subject.
    let blocked_by: Option<String> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let overlapping: Option<String> = tx
          .query_row(
            "SELECT instance_id FROM subscription_instances
             WHERE subject_id = ?1 AND status = 'active'
               AND start_at < ?2 AND end_at > ?3
             LIMIT 1",
            rusqlite::params![subject_str, end_ms, start_ms],
            |row| row.get(0),
          )
          .optional()?;

        if let Some(existing) = overlapping {
          if !replace {
            return Ok(Some(existing));
          }
          tx.execute(
            "UPDATE subscription_instances SET status = 'canceled'
             WHERE instance_id = ?1",
            rusqlite::params![existing],
          )?;
        }

        tx.execute(
          "INSERT INTO subscription_instances (
             instance_id, subject_id, plan_id, name, price,
             duration, duration_unit, limits_json,
             start_at, end_at, status, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
          rusqlite::params![
            id_str,
            subject_str,
            plan_str,
            name,
            price,
            dur,
            unit,
            limits_json,
            start_ms,
            end_ms,
            status,
            created_ms,
          ],
        )?;

        tx.commit()?;
        Ok(None)
      })
      .await?;

    match blocked_by {
      Some(existing) => Ok(RegisterOutcome::OverlappingActive {
        existing: crate::encode::decode_uuid(&existing)?,
      }),
      None => Ok(RegisterOutcome::Registered(instance)),
    }
  }

  async fn get_instance(
    &self,
    instance_id: Uuid,
  ) -> Result<Option<SubscriptionInstance>> {
    let id_str = encode_uuid(instance_id);

    let raw: Option<RawInstance> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {INSTANCE_COLUMNS} FROM subscription_instances
                 WHERE instance_id = ?1"
              ),
              rusqlite::params![id_str],
              instance_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawInstance::into_instance).transpose()
  }

  async fn find_active_instance(
    &self,
    subject_id: Uuid,
    at: DateTime<Utc>,
  ) -> Result<Option<SubscriptionInstance>> {
    let subject_str = encode_uuid(subject_id);
    let at_ms = encode_ts(at);

    let raw: Option<RawInstance> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {INSTANCE_COLUMNS} FROM subscription_instances
                 WHERE subject_id = ?1 AND status = 'active'
                   AND start_at <= ?2 AND end_at > ?2
                 ORDER BY start_at DESC
                 LIMIT 1"
              ),
              rusqlite::params![subject_str, at_ms],
              instance_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawInstance::into_instance).transpose()
  }

  async fn list_instances(
    &self,
    subject_id: Uuid,
  ) -> Result<Vec<SubscriptionInstance>> {
    let subject_str = encode_uuid(subject_id);

    let raws: Vec<RawInstance> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {INSTANCE_COLUMNS} FROM subscription_instances
           WHERE subject_id = ?1
           ORDER BY start_at DESC"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![subject_str], instance_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawInstance::into_instance).collect()
  }
}

// ─── UsageStore impl ─────────────────────────────────────────────────────────

impl UsageStore for SqliteStore {
  type Error = Error;

  async fn find_record(&self, key: &UsageKey) -> Result<Option<UsageRecord>> {
    let k = KeyParams::from_key(key);

    let raw: Option<RawUsageRecord> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {USAGE_COLUMNS} FROM usage_records
                 WHERE instance_id = ?1 AND subject_id = ?2
                   AND module_key = ?3 AND COALESCE(function_key, '') = ?4
                   AND window_start = ?5 AND window_end = ?6"
              ),
              rusqlite::params![
                k.instance, k.subject, k.module, k.function_coalesced,
                k.start, k.end,
              ],
              usage_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawUsageRecord::into_record).transpose()
  }

  async fn insert_record(&self, record: UsageRecord) -> Result<InsertOutcome> {
    let k = KeyParams::from_key(&record.key());
    let window_type = record.window_type.as_str().to_owned();
    let window_unit = record.window_unit.as_str().to_owned();
    let window_size = i64::from(record.window_size);
    let used        = encode_count(record.used);
    let quota       = encode_count(record.quota);
    let bonus_at    = record.last_bonus_at.map(encode_ts);
    let bonus_src   = record.bonus_source.clone();
    let bonus_exp   = record.bonus_expires_at.map(encode_ts);

    let inserted: bool = self
      .conn
      .call(move |conn| {
        let result = conn.execute(
          "INSERT INTO usage_records (
             instance_id, subject_id, module_key, function_key,
             window_type, window_unit, window_size, window_start, window_end,
             used, quota, last_bonus_at, bonus_source, bonus_expires_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
          rusqlite::params![
            k.instance, k.subject, k.module, k.function,
            window_type, window_unit, window_size, k.start, k.end,
            used, quota, bonus_at, bonus_src, bonus_exp,
          ],
        );
        match result {
          Ok(_) => Ok(true),
          Err(e) if is_unique_violation(&e) => Ok(false),
          Err(e) => Err(e.into()),
        }
      })
      .await?;

    if inserted {
      Ok(InsertOutcome::Inserted(record))
    } else {
      Ok(InsertOutcome::Conflict)
    }
  }

  async fn consume_one(&self, key: &UsageKey) -> Result<Option<UsageRecord>> {
    let k = KeyParams::from_key(key);

    let raw: Option<RawUsageRecord> = self
      .conn
      .call(move |conn| {
        // The guard and the increment are one statement; the database is
        // the only arbiter of the quota ceiling.
        let n = conn.execute(
          "UPDATE usage_records SET used = used + 1
           WHERE instance_id = ?1 AND subject_id = ?2
             AND module_key = ?3 AND COALESCE(function_key, '') = ?4
             AND window_start = ?5 AND window_end = ?6
             AND used < quota",
          rusqlite::params![
            k.instance, k.subject, k.module, k.function_coalesced,
            k.start, k.end,
          ],
        )?;
        if n == 0 {
          return Ok(None);
        }

        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {USAGE_COLUMNS} FROM usage_records
                 WHERE instance_id = ?1 AND subject_id = ?2
                   AND module_key = ?3 AND COALESCE(function_key, '') = ?4
                   AND window_start = ?5 AND window_end = ?6"
              ),
              rusqlite::params![
                k.instance, k.subject, k.module, k.function_coalesced,
                k.start, k.end,
              ],
              usage_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawUsageRecord::into_record).transpose()
  }

  async fn add_quota(
    &self,
    key: &UsageKey,
    amount: u64,
    insert_base_quota: u64,
    meta: WindowMeta,
    stamp: BonusStamp,
  ) -> Result<UsageRecord> {
    let k = KeyParams::from_key(key);
    let amount_i     = encode_count(amount);
    let insert_quota = encode_count(insert_base_quota.saturating_add(amount));
    let window_type  = meta.window_type.as_str().to_owned();
    let window_unit  = meta.window_unit.as_str().to_owned();
    let window_size  = i64::from(meta.window_size);
    let granted_ms   = encode_ts(stamp.granted_at);
    let source       = stamp.source;
    let expires_ms   = stamp.expires_at.map(encode_ts);

    let raw: RawUsageRecord = self
      .conn
      .call(move |conn| {
        // Update first; fall back to insert for a fresh window. A lost
        // insert race (another writer created the row in between) lands
        // back on the update path.
        let update_sql = "UPDATE usage_records SET
             quota = quota + ?7,
             last_bonus_at = ?8,
             bonus_source = ?9,
             bonus_expires_at = COALESCE(?10, bonus_expires_at)
           WHERE instance_id = ?1 AND subject_id = ?2
             AND module_key = ?3 AND COALESCE(function_key, '') = ?4
             AND window_start = ?5 AND window_end = ?6";

        let mut n = conn.execute(
          update_sql,
          rusqlite::params![
            k.instance, k.subject, k.module, k.function_coalesced,
            k.start, k.end, amount_i, granted_ms, source, expires_ms,
          ],
        )?;
        if n == 0 {
          let result = conn.execute(
            "INSERT INTO usage_records (
               instance_id, subject_id, module_key, function_key,
               window_type, window_unit, window_size, window_start, window_end,
               used, quota, last_bonus_at, bonus_source, bonus_expires_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?12, ?13)",
            rusqlite::params![
              k.instance, k.subject, k.module, k.function,
              window_type, window_unit, window_size, k.start, k.end,
              insert_quota, granted_ms, source, expires_ms,
            ],
          );
          match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
              n = conn.execute(
                update_sql,
                rusqlite::params![
                  k.instance, k.subject, k.module, k.function_coalesced,
                  k.start, k.end, amount_i, granted_ms, source, expires_ms,
                ],
              )?;
              if n == 0 {
                return Err(rusqlite::Error::QueryReturnedNoRows.into());
              }
            }
            Err(e) => return Err(e.into()),
          }
        }

        conn
          .query_row(
            &format!(
              "SELECT {USAGE_COLUMNS} FROM usage_records
               WHERE instance_id = ?1 AND subject_id = ?2
                 AND module_key = ?3 AND COALESCE(function_key, '') = ?4
                 AND window_start = ?5 AND window_end = ?6"
            ),
            rusqlite::params![
              k.instance, k.subject, k.module, k.function_coalesced,
              k.start, k.end,
            ],
            usage_row,
          )
          .map_err(Into::into)
      })
      .await?;

    raw.into_record()
  }

  async fn record_usage(
    &self,
    key: &UsageKey,
    amount: u64,
    meta: WindowMeta,
    insert_quota: u64,
  ) -> Result<UsageRecord> {
    let k = KeyParams::from_key(key);
    let amount_i    = encode_count(amount);
    let quota_i     = encode_count(insert_quota);
    let window_type = meta.window_type.as_str().to_owned();
    let window_unit = meta.window_unit.as_str().to_owned();
    let window_size = i64::from(meta.window_size);

    let raw: RawUsageRecord = self
      .conn
      .call(move |conn| {
        let update_sql = "UPDATE usage_records SET used = used + ?7
           WHERE instance_id = ?1 AND subject_id = ?2
             AND module_key = ?3 AND COALESCE(function_key, '') = ?4
             AND window_start = ?5 AND window_end = ?6";

        let mut n = conn.execute(
          update_sql,
          rusqlite::params![
            k.instance, k.subject, k.module, k.function_coalesced,
            k.start, k.end, amount_i,
          ],
        )?;
        if n == 0 {
          let result = conn.execute(
            "INSERT INTO usage_records (
               instance_id, subject_id, module_key, function_key,
               window_type, window_unit, window_size, window_start, window_end,
               used, quota
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
              k.instance, k.subject, k.module, k.function,
              window_type, window_unit, window_size, k.start, k.end,
              amount_i, quota_i,
            ],
          );
          match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
              n = conn.execute(
                update_sql,
                rusqlite::params![
                  k.instance, k.subject, k.module, k.function_coalesced,
                  k.start, k.end, amount_i,
                ],
              )?;
              if n == 0 {
                return Err(rusqlite::Error::QueryReturnedNoRows.into());
              }
            }
            Err(e) => return Err(e.into()),
          }
        }

        conn
          .query_row(
            &format!(
              "SELECT {USAGE_COLUMNS} FROM usage_records
               WHERE instance_id = ?1 AND subject_id = ?2
                 AND module_key = ?3 AND COALESCE(function_key, '') = ?4
                 AND window_start = ?5 AND window_end = ?6"
            ),
            rusqlite::params![
              k.instance, k.subject, k.module, k.function_coalesced,
              k.start, k.end,
            ],
            usage_row,
          )
          .map_err(Into::into)
      })
      .await?;

    raw.into_record()
  }

  async fn expired_bonus_records(
    &self,
    now: DateTime<Utc>,
  ) -> Result<Vec<UsageRecord>> {
    let now_ms = encode_ts(now);

    let raws: Vec<RawUsageRecord> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {USAGE_COLUMNS} FROM usage_records
           WHERE bonus_expires_at IS NOT NULL AND bonus_expires_at < ?1
             AND bonus_source IS NOT NULL"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![now_ms], usage_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawUsageRecord::into_record).collect()
  }

  async fn reset_bonus(&self, key: &UsageKey, base_quota: u64) -> Result<bool> {
    let k = KeyParams::from_key(key);
    let quota_i = encode_count(base_quota);

    let n: usize = self
      .conn
      .call(move |conn| {
        // The bonus_source guard makes the sweep idempotent: a second pass
        // matches nothing. `used` is deliberately left untouched.
        Ok(conn.execute(
          "UPDATE usage_records SET
             quota = ?7,
             last_bonus_at = NULL,
             bonus_source = NULL,
             bonus_expires_at = NULL
           WHERE instance_id = ?1 AND subject_id = ?2
             AND module_key = ?3 AND COALESCE(function_key, '') = ?4
             AND window_start = ?5 AND window_end = ?6
             AND bonus_source IS NOT NULL",
          rusqlite::params![
            k.instance, k.subject, k.module, k.function_coalesced,
            k.start, k.end, quota_i,
          ],
        )?)
      })
      .await?;

    Ok(n > 0)
  }

  async fn bonus_records(
    &self,
    instance_id: Uuid,
    subject_id: Uuid,
    window: Window,
  ) -> Result<Vec<UsageRecord>> {
    let instance_str = encode_uuid(instance_id);
    let subject_str  = encode_uuid(subject_id);
    let start_ms     = encode_ts(window.start);
    let end_ms       = encode_ts(window.end);

    let raws: Vec<RawUsageRecord> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {USAGE_COLUMNS} FROM usage_records
           WHERE instance_id = ?1 AND subject_id = ?2
             AND window_start = ?3 AND window_end = ?4
             AND bonus_source IS NOT NULL
           ORDER BY module_key, function_key"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![instance_str, subject_str, start_ms, end_ms],
            usage_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawUsageRecord::into_record).collect()
  }
}
