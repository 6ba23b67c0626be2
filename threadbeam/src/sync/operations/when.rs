//! All-resolve / first-reject-wins combination.

use std::sync::Arc;

use threadbeam_io::Mutex;

use crate::sync::deferred::Defer;
use crate::sync::operations::DeferredLike;

/// Tracks one combinator instance. Owned state rather than anything closure
/// local, so re-entered callbacks cannot double count.
struct WhenProgress {
    resolved: usize,
    rejected: bool,
}

/// Returns a payload-less deferred that resolves once every input has
/// resolved and rejects as soon as any input rejects.
///
/// The first rejection wins: later settlements of the remaining inputs are
/// ignored by the combinator (their own state is unaffected), and the
/// combined deferred never resolves after rejecting. An empty input set
/// resolves immediately.
///
/// The members may be any mix of payload types via [`crate::when!`], which
/// boxes each handle down to [`DeferredLike`].
pub fn when<I>(deferreds: I) -> Defer
where
    I: IntoIterator,
    I::Item: DeferredLike,
{
    let members: Vec<I::Item> = deferreds.into_iter().collect();
    let combined = Defer::new();
    let total = members.len();
    if total == 0 {
        combined.resolve(());
        return combined;
    }
    let progress = Arc::new(Mutex::new(WhenProgress {
        resolved: 0,
        rejected: false,
    }));
    for member in &members {
        {
            let progress = progress.clone();
            let combined = combined.clone();
            member.done_zero(Box::new(move || {
                let all_resolved = {
                    let mut progress = progress.lock();
                    progress.resolved += 1;
                    !progress.rejected && progress.resolved == total
                };
                if all_resolved {
                    combined.resolve(());
                }
            }));
        }
        {
            let progress = progress.clone();
            let combined = combined.clone();
            member.fail_zero(Box::new(move || {
                let first_rejection = {
                    let mut progress = progress.lock();
                    if progress.rejected {
                        false
                    } else {
                        progress.rejected = true;
                        true
                    }
                };
                if first_rejection {
                    combined.reject(());
                }
            }));
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::mailbox::process_queued;
    use crate::sync::deferred::{Deferred, PromiseState};

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(8)]
    fn resolves_only_after_every_member(#[case] count: usize) {
        let members: Vec<Deferred<u32>> = (0..count).map(|_| Deferred::new()).collect();
        let combined = when(members.clone());
        for (index, member) in members.iter().enumerate() {
            assert_eq!(combined.state(), PromiseState::Pending);
            member.resolve(index as u32);
            process_queued();
        }
        assert_eq!(combined.state(), PromiseState::Resolved);
    }

    #[test]
    fn empty_input_resolves_immediately() {
        let combined = when(Vec::<Deferred<()>>::new());
        assert_eq!(combined.state(), PromiseState::Resolved);
    }

    #[test]
    fn first_rejection_wins() {
        let members: Vec<Deferred<u32>> = (0..3).map(|_| Deferred::new()).collect();
        let combined = when(members.clone());
        members[0].resolve(0);
        members[1].reject(1);
        process_queued();
        assert_eq!(combined.state(), PromiseState::Rejected);
        // a straggler resolving afterwards must not flip the outcome
        members[2].resolve(2);
        process_queued();
        assert_eq!(combined.state(), PromiseState::Rejected);
    }

    #[test]
    fn members_settle_from_other_threads_in_any_order() {
        let members: Vec<Deferred<u32>> = (0..3).map(|_| Deferred::new()).collect();
        let combined = when(members.clone());
        let mut handles = Vec::new();
        for (index, member) in members.into_iter().enumerate().rev() {
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(5 * index as u64));
                member.resolve(index as u32);
            }));
        }
        assert!(combined.wait());
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn mixed_payload_types_through_the_macro() {
        let numbers = Deferred::<u32>::new();
        let text = Deferred::<String>::new();
        let nothing = Defer::new();
        let combined = crate::when!(numbers, text, nothing);
        numbers.resolve(1);
        text.resolve("done".to_owned());
        nothing.resolve(());
        process_queued();
        assert_eq!(combined.state(), PromiseState::Resolved);
    }
}
