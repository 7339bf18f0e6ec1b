//! Microbenchmarks of the local grant path.
//!
//! A single-node lockspace masters every resource, so these measure the
//! request/convert/unlock machinery without any messaging:
//! - Uncontended lock + unlock over a spread of resource names.
//! - Shared locks piling up on one resource.
//! - Up- and down-conversion of a held lock.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode, Throughput};

use oxidlm::cluster::{Directory, HashDirectory, Membership, NodeId, Transport, TransportError};
use oxidlm::{AstQueue, Collaborators, Lksb, LockFlags, LockMode, LockRequest, Lockspace, LockspaceConfig, Status};

struct NoNetwork;

impl Transport for NoNetwork {
    fn send(&self, to: NodeId, _frame: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::Unreachable(to))
    }
}

struct Solo;

impl Membership for Solo {
    fn our_nodeid(&self) -> NodeId {
        1
    }

    fn is_member(&self, nodeid: NodeId) -> bool {
        nodeid == 1
    }

    fn is_removed(&self, _nodeid: NodeId) -> bool {
        false
    }
}

fn solo_lockspace() -> (Lockspace, Arc<AstQueue>) {
    let asts = Arc::new(AstQueue::new());
    let collaborators = Collaborators {
        directory: Arc::new(HashDirectory::new(&[1])) as Arc<dyn Directory>,
        transport: Arc::new(NoNetwork),
        membership: Arc::new(Solo),
        asts: asts.clone(),
    };
    let config = LockspaceConfig::new().with_timewarn_cs(0);
    let ls = Lockspace::new("bench", 1, config, collaborators).expect("valid bench config");
    (ls, asts)
}

fn request(name: &[u8], mode: LockMode, lksb: &Arc<Lksb>) -> LockRequest {
    LockRequest::new(name, mode, Arc::clone(lksb)).with_completion(|sb| {
        black_box(sb.status());
    })
}

fn bench_lock_unlock(c: &mut Criterion) {
    let mut group = c.benchmark_group("grant/lock_unlock");
    group.sampling_mode(SamplingMode::Flat);
    group.measurement_time(Duration::from_secs(5));

    for names in [1usize, 64, 4096] {
        let (ls, asts) = solo_lockspace();
        let keys: Vec<Vec<u8>> = (0..names).map(|i| format!("res-{i:06}").into_bytes()).collect();
        let lksb = Lksb::new();
        let mut next = 0usize;

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("names", names), |b| {
            b.iter(|| {
                let name = &keys[next % keys.len()];
                next += 1;
                let rv = ls.lock(request(name, LockMode::Ex, &lksb));
                assert_eq!(rv, Status::InProgress);
                let rv = ls.unlock(lksb.lock_id(), LockFlags::empty(), &lksb);
                black_box(rv);
                asts.deliver_pending();
            })
        });
    }
    group.finish();
}

fn bench_shared_pileup(c: &mut Criterion) {
    let mut group = c.benchmark_group("grant/shared_pileup");
    group.sampling_mode(SamplingMode::Flat);

    for holders in [16usize, 256] {
        group.throughput(Throughput::Elements(holders as u64));
        group.bench_function(BenchmarkId::new("holders", holders), |b| {
            b.iter(|| {
                let (ls, asts) = solo_lockspace();
                let lksbs: Vec<Arc<Lksb>> = (0..holders).map(|_| Lksb::new()).collect();
                for lksb in &lksbs {
                    ls.lock(request(b"hot", LockMode::Pr, lksb));
                }
                for lksb in &lksbs {
                    ls.unlock(lksb.lock_id(), LockFlags::empty(), lksb);
                }
                black_box(asts.deliver_pending());
            })
        });
    }
    group.finish();
}

fn bench_convert(c: &mut Criterion) {
    let (ls, asts) = solo_lockspace();
    let lksb = Lksb::new();
    ls.lock(request(b"converted", LockMode::Nl, &lksb));
    asts.deliver_pending();

    c.bench_function("grant/convert_nl_ex_nl", |b| {
        b.iter(|| {
            for mode in [LockMode::Ex, LockMode::Nl] {
                let req = LockRequest::convert(Arc::clone(&lksb), mode).with_completion(|sb| {
                    black_box(sb.status());
                });
                black_box(ls.lock(req));
            }
            asts.deliver_pending();
        })
    });
}

criterion_group!(
    benches,
    bench_lock_unlock,
    bench_shared_pileup,
    bench_convert
);
criterion_main!(benches);
