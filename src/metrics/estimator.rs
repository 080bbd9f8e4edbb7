// 基数估计器
// 封装 HyperLogLog sketch，对外只暴露 record / snapshot / merge_into / estimate
// sketch 的位级算法由 hyperloglogplus 提供，本模块不关心其内部实现

use std::collections::hash_map::DefaultHasher;
use std::hash::BuildHasher;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use hyperloglogplus::{HyperLogLog, HyperLogLogPlus};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::{PgConnection, Row};

use crate::error::MetricsError;

/// 无随机种子的哈希构造器，同一构建产物的多实例间 sketch 可合并
/// 标准库不承诺 DefaultHasher 算法跨版本稳定，工具链升级后历史 sketch 的合并只作近似
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StableHashBuilder;

impl BuildHasher for StableHashBuilder {
    type Hasher = DefaultHasher;

    fn build_hasher(&self) -> DefaultHasher {
        DefaultHasher::new()
    }
}

type Sketch = HyperLogLogPlus<String, StableHashBuilder>;

/// 一个 flush 纪元内冻结的 sketch 副本与期间的观测总数
/// 每个纪元恰好产生一次、被 flush 事务消费一次，生成后不可变
#[derive(Debug, Clone)]
pub struct SketchSnapshot {
    pub sketch_bytes: Vec<u8>,
    pub observation_count: u64,
}

struct EstimatorInner {
    sketch: Sketch,
    total: u64,
}

/// 去重计数聚合器，按天落入单表
pub struct CardinalityEstimator {
    inner: Mutex<EstimatorInner>,
    table_name: String,
    precision: u8,
}

impl CardinalityEstimator {
    pub fn new(table_name: impl Into<String>, precision: u8) -> Result<Self, MetricsError> {
        Ok(Self {
            inner: Mutex::new(EstimatorInner {
                sketch: fresh_sketch(precision)?,
                total: 0,
            }),
            table_name: table_name.into(),
            precision,
        })
    }

    fn lock(&self) -> MutexGuard<'_, EstimatorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 把一个原始标识（如客户端IP）折入当前 sketch
    pub fn record(&self, id: &str) {
        let mut inner = self.lock();
        inner.sketch.insert(&id.to_string());
        inner.total += 1;
    }

    /// 换出当前 sketch 并返回序列化副本与期间观测数，计数归零
    /// 本纪元无观测时返回 None，调用方据此跳过落库
    pub fn snapshot(&self) -> Result<Option<SketchSnapshot>, MetricsError> {
        let replacement = fresh_sketch(self.precision)?;
        let (sketch, total) = {
            let mut inner = self.lock();
            if inner.total == 0 {
                return Ok(None);
            }
            let sketch = std::mem::replace(&mut inner.sketch, replacement);
            let total = std::mem::take(&mut inner.total);
            (sketch, total)
        };

        Ok(Some(SketchSnapshot {
            sketch_bytes: encode_sketch(&sketch)?,
            observation_count: total,
        }))
    }

    /// 当前去重估计，仅用于运行状态展示，不与 flush 对齐
    pub fn estimate(&self) -> u64 {
        self.lock().sketch.count().round() as u64
    }

    /// 估计器运行统计
    pub fn stats(&self) -> Value {
        let mut inner = self.lock();
        let unique = inner.sketch.count().round() as u64;
        json!({
            "hll_unique_count": unique,
            "hll_total_count": inner.total,
            "hll_precision": self.precision,
        })
    }

    /// 在调用方事务内把快照合并进当天的持久化 sketch
    /// 行级锁防止多实例并发 flush 覆盖彼此的合并结果
    pub async fn merge_into(
        &self,
        conn: &mut PgConnection,
        snapshot: &SketchSnapshot,
        date_bucket: NaiveDate,
    ) -> Result<(), MetricsError> {
        let select = format!(
            "SELECT hll_sketch, total_count FROM {} WHERE date_bucket = $1 FOR UPDATE",
            self.table_name
        );
        let existing = sqlx::query(&select)
            .bind(date_bucket)
            .fetch_optional(&mut *conn)
            .await?;

        match existing {
            None => {
                let unique = estimate_sketch_bytes(&snapshot.sketch_bytes)?;
                let insert = format!(
                    "INSERT INTO {} (date_bucket, hll_sketch, total_count, unique_count, updated_at) \
                     VALUES ($1, $2, $3, $4, NOW())",
                    self.table_name
                );
                sqlx::query(&insert)
                    .bind(date_bucket)
                    .bind(&snapshot.sketch_bytes)
                    .bind(snapshot.observation_count as i64)
                    .bind(unique as i64)
                    .execute(&mut *conn)
                    .await?;
            }
            Some(row) => {
                let existing_bytes: Vec<u8> = row.try_get("hll_sketch")?;
                let existing_count: i64 = row.try_get("total_count")?;
                let (merged_bytes, unique) =
                    merge_sketch_bytes(Some(&existing_bytes), &snapshot.sketch_bytes)?;
                let update = format!(
                    "UPDATE {} SET hll_sketch = $2, total_count = $3, unique_count = $4, \
                     updated_at = NOW() WHERE date_bucket = $1",
                    self.table_name
                );
                sqlx::query(&update)
                    .bind(date_bucket)
                    .bind(&merged_bytes)
                    .bind(existing_count + snapshot.observation_count as i64)
                    .bind(unique as i64)
                    .execute(&mut *conn)
                    .await?;
            }
        }

        Ok(())
    }
}

fn fresh_sketch(precision: u8) -> Result<Sketch, MetricsError> {
    HyperLogLogPlus::new(precision, StableHashBuilder)
        .map_err(|e| MetricsError::Sketch(format!("{e:?}")))
}

fn encode_sketch(sketch: &Sketch) -> Result<Vec<u8>, MetricsError> {
    serde_json::to_vec(sketch).map_err(|e| MetricsError::Sketch(e.to_string()))
}

fn decode_sketch(bytes: &[u8]) -> Result<Sketch, MetricsError> {
    serde_json::from_slice(bytes).map_err(|e| MetricsError::Sketch(e.to_string()))
}

/// 合并两份序列化的 sketch，返回合并后的字节与去重估计
pub fn merge_sketch_bytes(
    existing: Option<&[u8]>,
    incoming: &[u8],
) -> Result<(Vec<u8>, u64), MetricsError> {
    let mut merged = match existing {
        Some(bytes) => {
            let mut sketch = decode_sketch(bytes)?;
            let incoming = decode_sketch(incoming)?;
            sketch
                .merge(&incoming)
                .map_err(|e| MetricsError::Sketch(format!("{e:?}")))?;
            sketch
        }
        None => decode_sketch(incoming)?,
    };
    let unique = merged.count().round() as u64;
    let bytes = encode_sketch(&merged)?;
    Ok((bytes, unique))
}

/// 序列化 sketch 的去重估计
pub fn estimate_sketch_bytes(bytes: &[u8]) -> Result<u64, MetricsError> {
    let mut sketch = decode_sketch(bytes)?;
    Ok(sketch.count().round() as u64)
}
