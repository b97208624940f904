use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use courtside::engine::{Engine, Environment};
use courtside::limits::SLOTS_PER_DAY;
use courtside::model::*;
use courtside::notify::NotifyHub;
use courtside::payment::MockPaymentGateway;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

struct Bench {
    engine: Arc<Engine>,
    gateway: Arc<MockPaymentGateway>,
    owner: Actor,
    next_day: i64,
}

impl Bench {
    fn open() -> Self {
        let dir = std::env::temp_dir().join(format!("courtside_bench_{}", Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let gateway = Arc::new(MockPaymentGateway::new());
        let env = Environment::new(gateway.clone(), Arc::new(NotifyHub::new()));
        let engine = Arc::new(Engine::new(dir.join("courtside.wal"), env).unwrap());
        let today = Day::from_ms(engine.now());
        Self {
            engine,
            gateway,
            owner: Actor::owner(Ulid::new()),
            next_day: today.succ().0,
        }
    }

    /// A fresh future day of slots on a new court.
    async fn court(&mut self) -> Vec<SlotInstance> {
        let key = BucketKey {
            facility_id: Ulid::new(),
            court_id: Ulid::new(),
            day: Day(self.next_day),
        };
        self.next_day += 1;
        let prices = BTreeMap::from([("football".to_string(), 4_000)]);
        self.engine.generate(self.owner, key, prices).await.unwrap()
    }
}

async fn phase1_sequential(bench: &mut Bench) {
    let n_courts = 80;
    let mut latencies = Vec::with_capacity(n_courts * SLOTS_PER_DAY);
    let start = Instant::now();
    for _ in 0..n_courts {
        for slot in bench.court().await {
            let t = Instant::now();
            let intent = bench
                .engine
                .reserve_slot(Ulid::new(), slot.id, "football")
                .await
                .unwrap();
            let session = intent.session_ref().unwrap().to_string();
            bench.gateway.mark_paid(&session);
            bench.engine.settle_session(&session).await.unwrap();
            latencies.push(t.elapsed());
        }
    }
    let elapsed = start.elapsed();
    let n = latencies.len();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} paid reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve + settle latency", &mut latencies);
}

async fn phase2_contention(bench: &mut Bench) {
    let contenders = 50;
    let slots = bench.court().await;
    let start = Instant::now();
    let mut handles = Vec::new();
    for slot in &slots {
        for _ in 0..contenders {
            let engine = bench.engine.clone();
            let slot_id = slot.id;
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                let won = engine.reserve(slot_id, Ulid::new(), "football").await.is_ok();
                (won, t.elapsed())
            }));
        }
    }
    let mut latencies = Vec::with_capacity(handles.len());
    let mut winners = 0;
    for h in handles {
        let (won, latency) = h.await.unwrap();
        winners += usize::from(won);
        latencies.push(latency);
    }
    let elapsed = start.elapsed();
    println!(
        "  {} slots x {contenders} contenders in {:.2}s, {winners} winners",
        slots.len(),
        elapsed.as_secs_f64()
    );
    assert_eq!(winners, slots.len(), "every slot must have exactly one winner");
    print_latency("reserve latency under contention", &mut latencies);
}

/// Kept below `MAX_CAS_RETRIES` so concurrent approvals never give up.
const JOINERS: usize = 6;

async fn phase3_games(bench: &mut Bench) {
    let slots = bench.court().await;
    let mut latencies = Vec::new();
    let start = Instant::now();
    let mut handles = Vec::new();
    for slot in &slots {
        let engine = bench.engine.clone();
        let slot_id = slot.id;
        handles.push(tokio::spawn(async move {
            let host = Ulid::new();
            let game = engine
                .create_game(host, slot_id, "football", PlayersNeeded { min: 2, max: 10 })
                .await
                .unwrap();
            let mut joins = Vec::new();
            for _ in 0..JOINERS {
                let engine = engine.clone();
                let game_id = game.id;
                joins.push(tokio::spawn(async move {
                    let t = Instant::now();
                    let player = Ulid::new();
                    engine.request_join(game_id, player).await.unwrap();
                    engine.approve(game_id, player, host).await.unwrap();
                    t.elapsed()
                }));
            }
            let mut out = Vec::new();
            for j in joins {
                out.push(j.await.unwrap());
            }
            out
        }));
    }
    for h in handles {
        latencies.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    println!(
        "  {} games filled with {JOINERS} players in {:.2}s",
        slots.len(),
        elapsed.as_secs_f64()
    );
    print_latency("join + approve latency", &mut latencies);
}

async fn phase4_compaction(bench: &mut Bench) {
    let before = bench.engine.wal_appends_since_compact().await;
    let t = Instant::now();
    bench.engine.compact_wal().await.unwrap();
    println!(
        "  compacted {before} appended events in {:.2}ms",
        t.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== courtside stress benchmark ===\n");
    let mut bench = Bench::open();

    println!("[phase 1] sequential reserve and settle");
    phase1_sequential(&mut bench).await;

    println!("\n[phase 2] contended reserve");
    phase2_contention(&mut bench).await;

    println!("\n[phase 3] concurrent game joins");
    phase3_games(&mut bench).await;

    println!("\n[phase 4] WAL compaction");
    phase4_compaction(&mut bench).await;

    println!("\n=== benchmark complete ===");
}
