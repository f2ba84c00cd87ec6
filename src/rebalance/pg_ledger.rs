//! PostgreSQL rebalance ledger
//!
//! Lives next to the queue tables so a restarted process still knows which
//! rebalances are in flight and which transactions were already broadcast.

use super::ledger::{LedgerEntry, RebalanceLedger, RebalanceStatus, Reservations};
use super::types::RebalanceRequest;
use crate::error::{RebalancerError, RebalancerResult};

use async_trait::async_trait;
use ethers::types::{Address, H256};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct PgRebalanceLedger {
    pool: PgPool,
}

impl PgRebalanceLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> RebalancerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rebalances (
                id UUID PRIMARY KEY,
                wallet VARCHAR(42) NOT NULL,
                request JSONB NOT NULL,
                status VARCHAR(20) NOT NULL,
                error TEXT,
                submitted_tx VARCHAR(66),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_rebalances_pending
            ON rebalances (wallet) WHERE status = 'pending'
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Rebalance ledger migrations complete");
        Ok(())
    }

    async fn transition(&self, id: Uuid, status: RebalanceStatus, error: Option<&str>) -> RebalancerResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE rebalances SET status = $2, error = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            warn!("Rebalance {} unknown or no longer pending, ignoring {:?}", id, status);
        } else {
            debug!("Rebalance {} is now {:?}", id, status);
        }
        Ok(())
    }
}

fn wallet_key(wallet: Address) -> String {
    format!("{:?}", wallet)
}

fn entry_from_row(row: &PgRow) -> RebalancerResult<LedgerEntry> {
    let request: RebalanceRequest = serde_json::from_value(row.try_get("request")?)?;
    let submitted_tx = row
        .try_get::<Option<String>, _>("submitted_tx")?
        .map(|tx| {
            tx.parse::<H256>()
                .map_err(|e| RebalancerError::Internal(format!("stored tx hash {}: {}", tx, e)))
        })
        .transpose()?;

    Ok(LedgerEntry {
        request,
        status: RebalanceStatus::parse(row.try_get::<&str, _>("status")?)?,
        error: row.try_get("error")?,
        submitted_tx,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RebalanceLedger for PgRebalanceLedger {
    async fn record_pending(&self, request: &RebalanceRequest) -> RebalancerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rebalances (id, wallet, request, status)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(request.id)
        .bind(wallet_key(request.wallet_address))
        .bind(serde_json::to_value(request)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_submission(&self, id: Uuid, tx_hash: Option<H256>) -> RebalancerResult<()> {
        let updated = sqlx::query(
            "UPDATE rebalances SET submitted_tx = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(tx_hash.map(|tx| format!("{:?}", tx)))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            warn!("Unknown rebalance {}, not recording submission {:?}", id, tx_hash);
        }
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid) -> RebalancerResult<()> {
        self.transition(id, RebalanceStatus::Completed, None).await
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> RebalancerResult<()> {
        self.transition(id, RebalanceStatus::Failed, Some(reason)).await
    }

    async fn get(&self, id: Uuid) -> RebalancerResult<Option<LedgerEntry>> {
        let row = sqlx::query(
            "SELECT request, status, error, submitted_tx, updated_at FROM rebalances WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn reservations(&self, wallet: Address) -> RebalancerResult<Reservations> {
        let rows = sqlx::query("SELECT request FROM rebalances WHERE wallet = $1 AND status = 'pending'")
            .bind(wallet_key(wallet))
            .fetch_all(&self.pool)
            .await?;

        let mut reservations = Reservations::default();
        for row in &rows {
            let request: RebalanceRequest = serde_json::from_value(row.try_get("request")?)?;
            reservations.reserve(&request);
        }
        Ok(reservations)
    }
}

#[cfg(test)]
mod tests {
    //! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`

    use super::*;
    use crate::rebalance::types::{RebalanceQuote, Strategy, TokenRef};
    use ethers::types::U256;
    use sqlx::postgres::PgPoolOptions;

    async fn ledger() -> PgRebalanceLedger {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.unwrap();
        let ledger = PgRebalanceLedger::new(pool);
        ledger.run_migrations().await.unwrap();
        ledger
    }

    fn request(wallet: Address) -> RebalanceRequest {
        let token = |chain_id| TokenRef {
            chain_id,
            address: Address::repeat_byte(0x0a),
            decimals: 6,
        };
        RebalanceRequest::new(
            wallet,
            RebalanceQuote::new(
                Strategy::Cctp,
                token(10),
                token(8453),
                U256::from(300u64),
                U256::from(299u64),
                serde_json::Value::Null,
            ),
        )
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_pending_entry_round_trips_with_submission() {
        let ledger = ledger().await;
        let wallet = Address::from_low_u64_be(rand::random());
        let req = request(wallet);
        ledger.record_pending(&req).await.unwrap();
        ledger
            .record_submission(req.id, Some(H256::repeat_byte(0x42)))
            .await
            .unwrap();

        let entry = ledger.get(req.id).await.unwrap().unwrap();
        assert_eq!(entry.request, req);
        assert_eq!(entry.status, RebalanceStatus::Pending);
        assert_eq!(entry.submitted_tx, Some(H256::repeat_byte(0x42)));

        let reservations = ledger.reservations(wallet).await.unwrap();
        assert_eq!(reservations.outgoing(10, Address::repeat_byte(0x0a)), U256::from(300u64));
        assert_eq!(reservations.incoming(8453, Address::repeat_byte(0x0a)), U256::from(299u64));
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_terminal_status_is_sticky_and_unknown_ids_are_ignored() {
        let ledger = ledger().await;
        let wallet = Address::from_low_u64_be(rand::random());
        let req = request(wallet);
        ledger.record_pending(&req).await.unwrap();

        ledger.mark_completed(req.id).await.unwrap();
        ledger.mark_failed(req.id, "late failure").await.unwrap();
        ledger.mark_completed(Uuid::new_v4()).await.unwrap();

        let entry = ledger.get(req.id).await.unwrap().unwrap();
        assert_eq!(entry.status, RebalanceStatus::Completed);
        assert_eq!(entry.error, None);
        assert!(ledger.reservations(wallet).await.unwrap().is_empty());
    }
}
