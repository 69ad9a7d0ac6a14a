//! Paged reading of the transaction listing, and the offset locator.
//!
//! The listing is addressed in **ascending** order: offset 0 is the oldest
//! matching transaction. Under that orientation new transactions append at
//! the end and never shift existing offsets; the only thing that can move an
//! offset is a deletion on the node, which the locator detects (a probe
//! falling outside its bracket, or a failed boundary validation) and answers
//! by restarting from scratch.
//!
//! [`locate`] finds where a transaction id sits in the listing: the exact
//! offset when the id is present, otherwise the insertion point (the offset
//! of the first entry with a greater id) so callers can resume paging after
//! an anchor that has since been deleted. The search fetches the newest page
//! first (direct hit for recent ids), then runs up to three
//! interpolation-search rounds before falling back to binary search, one
//! single-entry page per probe.

use tracing::{debug, warn};

use crate::client::{retry_idempotent, ApiError, KristClient, Order, TransactionPage};
use crate::filter::TransactionFilter;

/// Standard page size for listing reads.
pub const PAGE_LIMIT: u64 = 50;

const INTERPOLATION_ROUNDS: u32 = 3;
const MAX_RESTARTS: u32 = 8;

/// Where a target id sits in the ascending listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    /// Offset of the target when `exact`, otherwise the offset of the first
    /// entry whose id exceeds the target.
    pub offset: u64,
    /// Whether the target itself is present in the listing.
    pub exact: bool,
}

/// Fetch one page of the filtered listing, retrying transport failures
/// indefinitely. All listing reads are idempotent GETs.
pub async fn fetch_page(
    client: &KristClient,
    filter: &TransactionFilter,
    order: Order,
    offset: u64,
    limit: u64,
) -> Result<TransactionPage, ApiError> {
    retry_idempotent(None, || {
        client.lookup_transactions(filter, order, offset, limit)
    })
    .await
}

/// Locate `target` in the ascending filtered listing.
///
/// Returns `None` when the listing is empty. A `target` of `-1` (nothing
/// delivered yet) maps to offset 0, non-exact.
pub async fn locate(
    client: &KristClient,
    filter: &TransactionFilter,
    target: i64,
) -> Result<Option<Located>, ApiError> {
    for restart in 0..MAX_RESTARTS {
        if restart > 0 {
            warn!(target, restart, "offset locator restarting");
        }
        match locate_once(client, filter, target).await? {
            Attempt::Done(found) => return Ok(found),
            // A probe or validation revealed a concurrent deletion.
            Attempt::Restart => continue,
        }
    }
    Err(ApiError::Transport(format!(
        "offset locator for id {target} kept racing deletions",
    )))
}

/// Outcome of one full search attempt.
enum Attempt {
    Done(Option<Located>),
    Restart,
}

async fn locate_once(
    client: &KristClient,
    filter: &TransactionFilter,
    target: i64,
) -> Result<Attempt, ApiError> {
    // Newest page first: recent ids resolve without any probing, and the
    // response carries the listing total that brackets the search.
    let tail = fetch_page(client, filter, Order::Desc, 0, PAGE_LIMIT).await?;
    let total = tail.total;
    if total == 0 {
        return Ok(Attempt::Done(None));
    }
    if target < 0 {
        return Ok(Attempt::Done(Some(Located {
            offset: 0,
            exact: false,
        })));
    }

    // Ascending view of the tail page: offsets [total - len, total).
    let len = tail.transactions.len() as u64;
    let tail_base = total.saturating_sub(len);
    let ids: Vec<i64> = tail.transactions.iter().rev().map(|tx| tx.id).collect();
    let Some(&newest) = ids.last() else {
        // Non-zero total with an empty page: the listing moved mid-read.
        return Ok(Attempt::Restart);
    };

    if let Some(pos) = ids.iter().position(|&id| id == target) {
        let offset = tail_base + pos as u64;
        return match validate_exact(client, filter, offset, target).await? {
            true => Ok(Attempt::Done(Some(Located { offset, exact: true }))),
            false => Ok(Attempt::Restart),
        };
    }
    if target > newest {
        // Newer than everything: insertion at the end.
        return Ok(Attempt::Done(Some(Located {
            offset: total,
            exact: false,
        })));
    }
    if target >= ids[0] {
        // Inside the tail page's id range but absent.
        let Some(pos) = ids.iter().position(|&id| id > target) else {
            return Ok(Attempt::Restart);
        };
        return Ok(Attempt::Done(Some(Located {
            offset: tail_base + pos as u64,
            exact: false,
        })));
    }
    if tail_base == 0 {
        // The tail page was the whole listing and the target is older still.
        return Ok(Attempt::Done(Some(Located {
            offset: 0,
            exact: false,
        })));
    }

    // Bracket (lo_off, hi_off): ids at the boundaries straddle the target.
    // lo starts virtual (offset -1, id 0) since every real id is positive.
    let mut lo_off: i64 = -1;
    let mut lo_id: i64 = 0;
    let mut hi_off = tail_base as i64;
    let mut hi_id = ids[0];
    let mut round = 0u32;

    while hi_off - lo_off > 1 {
        let probe_off = if round < INTERPOLATION_ROUNDS {
            interpolate(lo_off, lo_id, hi_off, hi_id, target)
        } else {
            lo_off + (hi_off - lo_off) / 2
        };
        round += 1;
        let page = fetch_page(client, filter, Order::Asc, probe_off as u64, 1).await?;
        let Some(entry) = page.transactions.first() else {
            // The listing shrank below the probe offset.
            return Ok(Attempt::Restart);
        };
        let probed = entry.id;
        debug!(target, probe_off, probed, "locator probe");
        if probed == target {
            return match validate_exact(client, filter, probe_off as u64, target).await? {
                true => Ok(Attempt::Done(Some(Located {
                    offset: probe_off as u64,
                    exact: true,
                }))),
                false => Ok(Attempt::Restart),
            };
        }
        if probed <= lo_id || probed >= hi_id {
            // Monotonicity violation: a deletion shifted the listing under
            // the bracket.
            return Ok(Attempt::Restart);
        }
        if probed < target {
            lo_off = probe_off;
            lo_id = probed;
        } else {
            hi_off = probe_off;
            hi_id = probed;
        }
    }

    // Collapsed without an exact hit: the target is absent and hi_off is its
    // insertion point. Validate that the boundary really is adjacent.
    if lo_off >= 0 {
        let page = fetch_page(client, filter, Order::Asc, lo_off as u64, 2).await?;
        let ids: Vec<i64> = page.transactions.iter().map(|tx| tx.id).collect();
        if ids.first() != Some(&lo_id) || ids.get(1) != Some(&hi_id) {
            return Ok(Attempt::Restart);
        }
    }
    Ok(Attempt::Done(Some(Located {
        offset: hi_off as u64,
        exact: false,
    })))
}

/// Interpolation probe, clamped strictly inside the bracket.
fn interpolate(lo_off: i64, lo_id: i64, hi_off: i64, hi_id: i64, target: i64) -> i64 {
    let span_off = (hi_off - lo_off) as i128;
    let span_id = (hi_id - lo_id) as i128;
    let guess = lo_off as i128 + (target - lo_id) as i128 * span_off / span_id;
    (guess as i64).clamp(lo_off + 1, hi_off - 1)
}

/// Confirm an exact hit with a two-entry page at the boundary.
async fn validate_exact(
    client: &KristClient,
    filter: &TransactionFilter,
    offset: u64,
    target: i64,
) -> Result<bool, ApiError> {
    let page = fetch_page(client, filter, Order::Asc, offset, 2).await?;
    let ids: Vec<i64> = page.transactions.iter().map(|tx| tx.id).collect();
    let head_matches = ids.first() == Some(&target);
    let tail_ordered = ids.get(1).map_or(true, |&next| next > target);
    Ok(head_matches && tail_ordered)
}
