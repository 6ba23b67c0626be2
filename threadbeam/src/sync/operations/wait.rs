//! Blocking settlement wait.

use crate::mailbox;
use crate::sync::deferred::PromiseState;
use crate::sync::operations::DeferredLike;

/// Blocks the calling thread until every input deferred settles, returning
/// true only if all of them resolved.
///
/// "Blocks" means the thread keeps draining its own mailbox, so callbacks
/// registered on this thread (for these or any other deferreds) continue to
/// run while waiting; nested waits from inside such callbacks are fine.
/// Already-settled inputs are skipped without blocking.
///
/// Precondition: every pending input must be settled by some other thread.
/// The engine cannot detect a wait on a deferred that only the current
/// thread could settle; that is a caller bug and it deadlocks.
pub fn wait_all<I>(deferreds: I) -> bool
where
    I: IntoIterator,
    I::Item: DeferredLike,
{
    let members: Vec<I::Item> = deferreds.into_iter().collect();
    for member in &members {
        // wakers: guarantee a post lands on this thread at settlement so the
        // run loop below cannot park forever
        member.done_zero(Box::new(|| ()));
        member.fail_zero(Box::new(|| ()));
    }
    mailbox::run_while(|| {
        members
            .iter()
            .any(|member| member.state() == PromiseState::Pending)
    });
    members
        .iter()
        .all(|member| member.state() == PromiseState::Resolved)
}
