//! ERC20 and NFT balances.
//!
//! Balances are signed 512-bit integers stored as decimal text, so any
//! sequence of uint256 transfers fits. They are signed so that an indexer
//! started mid-history can represent an account that sent tokens it received
//! before the start block. Every delta is journaled in `balance_deltas` before
//! it touches a balance; a delta whose journal row already exists is skipped,
//! which makes re-application a no-op. Reverting a block replays its journal
//! rows inversely and deletes them.
//!
//! Transfers from or to the zero address are mints and burns. The zero address
//! itself has no balance row. Rows that return to zero are removed.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use sqlx::SqliteConnection;

use super::{hex, to_balance, ApplyContext, Balance, ProjectionWriter};
use crate::error::{TrackerError, TrackerResult};
use crate::events::{DecodedEvent, EventPayload};

/// Which balance table a delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ledger {
    /// `erc20_balances`, keyed by `(owner, token)`
    Erc20,
    /// `nft_balances`, keyed by `(owner, collection, token_id)`
    Nft,
}

impl Ledger {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Erc20 => "erc20",
            Self::Nft => "nft",
        }
    }
}

/// One signed change to one balance.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delta {
    seq: u32,
    owner: Address,
    token: Address,
    token_id: String,
    amount: Balance,
}

/// Maintains `erc20_balances`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Erc20BalanceWriter;

/// Maintains `nft_balances` for ERC721 and ERC1155 collections.
#[derive(Debug, Clone, Copy, Default)]
pub struct NftBalanceWriter;

#[async_trait]
impl ProjectionWriter for Erc20BalanceWriter {
    fn name(&self) -> &'static str {
        "erc20_balances"
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ApplyContext<'_>,
        event: &DecodedEvent,
    ) -> TrackerResult<bool> {
        let EventPayload::Erc20Transfer { from, to, value } = &event.payload else {
            return Ok(false);
        };
        let deltas = transfer_deltas(0, *from, *to, event.meta.address, String::new(), *value);
        apply_deltas(conn, Ledger::Erc20, ctx, event, deltas).await
    }

    async fn revert_block(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<u64> {
        revert_ledger(conn, Ledger::Erc20, stream_id, block_number).await
    }

    async fn prune_below(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<()> {
        prune_ledger(conn, Ledger::Erc20, stream_id, block_number).await
    }
}

#[async_trait]
impl ProjectionWriter for NftBalanceWriter {
    fn name(&self) -> &'static str {
        "nft_balances"
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ApplyContext<'_>,
        event: &DecodedEvent,
    ) -> TrackerResult<bool> {
        let EventPayload::NftTransfer { from, to, tokens, .. } = &event.payload else {
            return Ok(false);
        };

        let mut deltas = Vec::with_capacity(tokens.len() * 2);
        for (i, (token_id, amount)) in tokens.iter().enumerate() {
            let seq = u32::try_from(i * 2).map_err(|e| {
                TrackerError::decoding("NFT batch too large", Some(Box::new(e)))
            })?;
            deltas.extend(transfer_deltas(
                seq,
                *from,
                *to,
                event.meta.address,
                token_id.to_string(),
                *amount,
            ));
        }
        apply_deltas(conn, Ledger::Nft, ctx, event, deltas).await
    }

    async fn revert_block(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<u64> {
        revert_ledger(conn, Ledger::Nft, stream_id, block_number).await
    }

    async fn prune_below(
        &self,
        conn: &mut SqliteConnection,
        stream_id: &str,
        block_number: u64,
    ) -> TrackerResult<()> {
        prune_ledger(conn, Ledger::Nft, stream_id, block_number).await
    }
}

/// Sender and receiver deltas of a transfer, numbered `seq` and `seq + 1`.
fn transfer_deltas(
    seq: u32,
    from: Address,
    to: Address,
    token: Address,
    token_id: String,
    value: U256,
) -> Vec<Delta> {
    let amount = to_balance(value);

    let mut deltas = Vec::with_capacity(2);
    if from != Address::ZERO {
        deltas.push(Delta {
            seq,
            owner: from,
            token,
            token_id: token_id.clone(),
            amount: -amount,
        });
    }
    if to != Address::ZERO {
        deltas.push(Delta {
            seq: seq + 1,
            owner: to,
            token,
            token_id,
            amount,
        });
    }
    deltas
}

async fn apply_deltas(
    conn: &mut SqliteConnection,
    ledger: Ledger,
    ctx: &ApplyContext<'_>,
    event: &DecodedEvent,
    deltas: Vec<Delta>,
) -> TrackerResult<bool> {
    let meta = &event.meta;
    let mut changed = false;

    for delta in deltas {
        let journaled = sqlx::query(
            r"
            INSERT INTO balance_deltas (
                block_hash, log_index, seq, ledger, owner, token, token_id,
                delta, stream_id, block_number
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(block_hash, log_index, ledger, seq) DO NOTHING
            ",
        )
        .bind(hex(&meta.block_hash))
        .bind(meta.log_index as i64)
        .bind(i64::from(delta.seq))
        .bind(ledger.as_str())
        .bind(hex(&delta.owner))
        .bind(hex(&delta.token))
        .bind(&delta.token_id)
        .bind(delta.amount.to_string())
        .bind(ctx.stream_id)
        .bind(meta.block_number as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| TrackerError::database("Failed to journal balance delta", Some(Box::new(e))))?;

        if journaled.rows_affected() == 0 {
            continue;
        }

        adjust_balance(
            conn,
            ledger,
            &hex(&delta.owner),
            &hex(&delta.token),
            &delta.token_id,
            delta.amount,
            Some(meta.block_number),
        )
        .await?;
        changed = true;
    }

    Ok(changed)
}

async fn revert_ledger(
    conn: &mut SqliteConnection,
    ledger: Ledger,
    stream_id: &str,
    block_number: u64,
) -> TrackerResult<u64> {
    let rows = sqlx::query_as::<_, (String, String, String, String)>(
        r"
        SELECT owner, token, token_id, delta FROM balance_deltas
        WHERE stream_id = ? AND block_number = ? AND ledger = ?
        ORDER BY log_index DESC, seq DESC
        ",
    )
    .bind(stream_id)
    .bind(block_number as i64)
    .bind(ledger.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| TrackerError::database("Failed to load balance deltas", Some(Box::new(e))))?;

    sqlx::query("DELETE FROM balance_deltas WHERE stream_id = ? AND block_number = ? AND ledger = ?")
        .bind(stream_id)
        .bind(block_number as i64)
        .bind(ledger.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| TrackerError::database("Failed to delete balance deltas", Some(Box::new(e))))?;

    for (owner, token, token_id, delta) in &rows {
        let amount = parse_balance(delta)?;
        adjust_balance(conn, ledger, owner, token, token_id, -amount, None).await?;
    }

    Ok(rows.len() as u64)
}

async fn prune_ledger(
    conn: &mut SqliteConnection,
    ledger: Ledger,
    stream_id: &str,
    block_number: u64,
) -> TrackerResult<()> {
    sqlx::query("DELETE FROM balance_deltas WHERE stream_id = ? AND block_number < ? AND ledger = ?")
        .bind(stream_id)
        .bind(block_number as i64)
        .bind(ledger.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| TrackerError::database("Failed to prune balance deltas", Some(Box::new(e))))?;
    Ok(())
}

/// Add `amount` to a balance. With `last_block` unset (revert), the row's
/// provenance falls back to the newest remaining journal entry for the key.
async fn adjust_balance(
    conn: &mut SqliteConnection,
    ledger: Ledger,
    owner: &str,
    token: &str,
    token_id: &str,
    amount: Balance,
    last_block: Option<u64>,
) -> TrackerResult<()> {
    let current = match ledger {
        Ledger::Erc20 => sqlx::query_as::<_, (String, i64)>(
            "SELECT balance, last_block_number FROM erc20_balances WHERE owner = ? AND token = ?",
        )
        .bind(owner)
        .bind(token),
        Ledger::Nft => sqlx::query_as::<_, (String, i64)>(
            "SELECT balance, last_block_number FROM nft_balances WHERE owner = ? AND collection = ? AND token_id = ?",
        )
        .bind(owner)
        .bind(token)
        .bind(token_id),
    }
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| TrackerError::database("Failed to read balance", Some(Box::new(e))))?;

    let (balance, stored_block) = match current {
        Some((balance, block)) => (parse_balance(&balance)?, Some(block)),
        None => (Balance::ZERO, None),
    };
    let updated = balance.checked_add(amount).ok_or_else(|| {
        TrackerError::state(format!("Balance overflow for {owner} on {token}"), None)
    })?;

    if updated.is_zero() {
        match ledger {
            Ledger::Erc20 => sqlx::query("DELETE FROM erc20_balances WHERE owner = ? AND token = ?")
                .bind(owner)
                .bind(token),
            Ledger::Nft => sqlx::query(
                "DELETE FROM nft_balances WHERE owner = ? AND collection = ? AND token_id = ?",
            )
            .bind(owner)
            .bind(token)
            .bind(token_id),
        }
        .execute(&mut *conn)
        .await
        .map_err(|e| TrackerError::database("Failed to delete balance", Some(Box::new(e))))?;
        return Ok(());
    }

    let last_block = match last_block {
        Some(block) => block as i64,
        None => latest_journal_block(conn, ledger, owner, token, token_id)
            .await?
            .or(stored_block)
            .unwrap_or_default(),
    };

    match ledger {
        Ledger::Erc20 => sqlx::query(
            r"
            INSERT INTO erc20_balances (owner, token, balance, last_block_number)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(owner, token) DO UPDATE SET
                balance = excluded.balance,
                last_block_number = excluded.last_block_number
            ",
        )
        .bind(owner)
        .bind(token)
        .bind(updated.to_string())
        .bind(last_block),
        Ledger::Nft => sqlx::query(
            r"
            INSERT INTO nft_balances (owner, collection, token_id, balance, last_block_number)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(owner, collection, token_id) DO UPDATE SET
                balance = excluded.balance,
                last_block_number = excluded.last_block_number
            ",
        )
        .bind(owner)
        .bind(token)
        .bind(token_id)
        .bind(updated.to_string())
        .bind(last_block),
    }
    .execute(&mut *conn)
    .await
    .map_err(|e| TrackerError::database("Failed to write balance", Some(Box::new(e))))?;

    Ok(())
}

async fn latest_journal_block(
    conn: &mut SqliteConnection,
    ledger: Ledger,
    owner: &str,
    token: &str,
    token_id: &str,
) -> TrackerResult<Option<i64>> {
    let (block,): (Option<i64>,) = sqlx::query_as(
        r"
        SELECT MAX(block_number) FROM balance_deltas
        WHERE ledger = ? AND owner = ? AND token = ? AND token_id = ?
        ",
    )
    .bind(ledger.as_str())
    .bind(owner)
    .bind(token)
    .bind(token_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| TrackerError::database("Failed to read balance provenance", Some(Box::new(e))))?;
    Ok(block)
}

fn parse_balance(value: &str) -> TrackerResult<Balance> {
    Balance::from_dec_str(value).map_err(|e| {
        TrackerError::database(format!("Corrupt balance value in store: {value}"), Some(Box::new(e)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::test_support::{conn, event, no_metadata, STREAM};
    use alloy::primitives::address;

    const TOKEN: Address = address!("00000000000000000000000000000000000000aa");
    const A: Address = address!("000000000000000000000000000000000000000a");
    const B: Address = address!("000000000000000000000000000000000000000b");
    const C: Address = address!("000000000000000000000000000000000000000c");

    fn ctx() -> ApplyContext<'static> {
        ApplyContext {
            stream_id: STREAM,
            chain_id: 1,
            metadata: no_metadata(),
        }
    }

    fn erc20(block: u64, log_index: u64, from: Address, to: Address, value: u64) -> DecodedEvent {
        event(
            block,
            log_index,
            TOKEN,
            EventPayload::Erc20Transfer {
                from,
                to,
                value: U256::from(value),
            },
        )
    }

    async fn erc20_balance(conn: &mut SqliteConnection, owner: Address) -> Option<String> {
        sqlx::query_as::<_, (String,)>("SELECT balance FROM erc20_balances WHERE owner = ? AND token = ?")
            .bind(hex(&owner))
            .bind(hex(&TOKEN))
            .fetch_optional(&mut *conn)
            .await
            .unwrap()
            .map(|(b,)| b)
    }

    #[tokio::test]
    async fn test_transfer_chain_in_one_block() {
        let mut conn = conn().await;
        let writer = Erc20BalanceWriter;
        writer.apply(&mut conn, &ctx(), &erc20(100, 0, A, B, 5)).await.unwrap();
        writer.apply(&mut conn, &ctx(), &erc20(100, 1, B, C, 5)).await.unwrap();

        assert_eq!(erc20_balance(&mut conn, A).await.as_deref(), Some("-5"));
        assert_eq!(erc20_balance(&mut conn, B).await, None);
        assert_eq!(erc20_balance(&mut conn, C).await.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_reapply_is_noop() {
        let mut conn = conn().await;
        let writer = Erc20BalanceWriter;
        let transfer = erc20(7, 0, A, B, 3);
        assert!(writer.apply(&mut conn, &ctx(), &transfer).await.unwrap());
        assert!(!writer.apply(&mut conn, &ctx(), &transfer).await.unwrap());
        assert_eq!(erc20_balance(&mut conn, B).await.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_mint_and_burn_skip_zero_address() {
        let mut conn = conn().await;
        let writer = Erc20BalanceWriter;
        writer.apply(&mut conn, &ctx(), &erc20(1, 0, Address::ZERO, A, 10)).await.unwrap();
        writer.apply(&mut conn, &ctx(), &erc20(2, 0, A, Address::ZERO, 4)).await.unwrap();

        assert_eq!(erc20_balance(&mut conn, A).await.as_deref(), Some("6"));
        assert_eq!(erc20_balance(&mut conn, Address::ZERO).await, None);
    }

    #[tokio::test]
    async fn test_self_transfer_nets_to_zero_change() {
        let mut conn = conn().await;
        let writer = Erc20BalanceWriter;
        writer.apply(&mut conn, &ctx(), &erc20(1, 0, Address::ZERO, A, 10)).await.unwrap();
        writer.apply(&mut conn, &ctx(), &erc20(2, 0, A, A, 4)).await.unwrap();
        assert_eq!(erc20_balance(&mut conn, A).await.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_revert_restores_previous_state() {
        let mut conn = conn().await;
        let writer = Erc20BalanceWriter;
        writer.apply(&mut conn, &ctx(), &erc20(1, 0, Address::ZERO, A, 10)).await.unwrap();
        writer.apply(&mut conn, &ctx(), &erc20(2, 0, A, B, 4)).await.unwrap();
        writer.apply(&mut conn, &ctx(), &erc20(2, 1, B, C, 1)).await.unwrap();

        assert_eq!(writer.revert_block(&mut conn, STREAM, 2).await.unwrap(), 4);
        assert_eq!(erc20_balance(&mut conn, A).await.as_deref(), Some("10"));
        assert_eq!(erc20_balance(&mut conn, B).await, None);
        assert_eq!(erc20_balance(&mut conn, C).await, None);

        let (last,): (i64,) = sqlx::query_as("SELECT last_block_number FROM erc20_balances WHERE owner = ?")
            .bind(hex(&A))
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(last, 1);

        // The reverted events can be applied again
        assert!(writer.apply(&mut conn, &ctx(), &erc20(2, 0, A, B, 4)).await.unwrap());
        assert_eq!(erc20_balance(&mut conn, B).await.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_nft_batch_balances() {
        let mut conn = conn().await;
        let writer = NftBalanceWriter;
        let batch = event(
            3,
            0,
            TOKEN,
            EventPayload::NftTransfer {
                from: A,
                to: B,
                tokens: vec![(U256::from(1), U256::from(2)), (U256::from(9), U256::from(1))],
                multi_token: true,
            },
        );
        assert!(writer.apply(&mut conn, &ctx(), &batch).await.unwrap());
        assert!(!writer.apply(&mut conn, &ctx(), &batch).await.unwrap());

        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT owner, token_id, balance FROM nft_balances ORDER BY owner, token_id",
        )
        .fetch_all(&mut *conn)
        .await
        .unwrap();
        assert_eq!(
            rows,
            vec![
                (hex(&A), "1".to_string(), "-2".to_string()),
                (hex(&A), "9".to_string(), "-1".to_string()),
                (hex(&B), "1".to_string(), "2".to_string()),
                (hex(&B), "9".to_string(), "1".to_string()),
            ]
        );

        // ERC20 writer ignores NFT events
        assert!(!Erc20BalanceWriter.apply(&mut conn, &ctx(), &batch).await.unwrap());
        assert_eq!(writer.revert_block(&mut conn, STREAM, 3).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_amounts_beyond_int256_are_kept_exactly() {
        let mut conn = conn().await;
        let writer = Erc20BalanceWriter;
        let half = U256::from(1) << 255;
        let huge = |block, log_index, from, to, value| {
            event(block, log_index, TOKEN, EventPayload::Erc20Transfer { from, to, value })
        };

        writer.apply(&mut conn, &ctx(), &huge(5, 0, A, B, half)).await.unwrap();
        for log_index in 1..=3 {
            writer.apply(&mut conn, &ctx(), &huge(6, log_index, Address::ZERO, B, U256::MAX)).await.unwrap();
        }

        let minus_half = format!("-{half}");
        assert_eq!(erc20_balance(&mut conn, A).await, Some(minus_half));
        let expected = to_balance(half) + to_balance(U256::MAX) * Balance::try_from(3).unwrap();
        assert_eq!(erc20_balance(&mut conn, B).await, Some(expected.to_string()));

        writer.revert_block(&mut conn, STREAM, 6).await.unwrap();
        assert_eq!(erc20_balance(&mut conn, B).await, Some(half.to_string()));
    }
}
