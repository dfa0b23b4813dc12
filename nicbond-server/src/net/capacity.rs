use crate::config::CHECK_INTERVAL;
use crate::net::ledger::{ByteLedger, Lane};
use arc_swap::ArcSwap;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

const MB: f64 = 1024.0 * 1024.0;

/// Weighted probe-lane candidate.
#[derive(Debug, Clone)]
pub struct ProbeEntry {
    pub ip: IpAddr,
    pub weight: f64,
}

/// Weighted chunk-lane candidate: one per (interface, common-client slot).
#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub ip: IpAddr,
    pub slot: u8,
    pub weight: f64,
}

/// One published selection snapshot. Immutable once stored; readers either
/// see this snapshot or the previous one, never a partial update.
#[derive(Debug, Clone, Default)]
pub struct LaneChoices {
    pub probe: Vec<ProbeEntry>,
    pub total_probe: f64,
    pub chunks: Vec<ChunkEntry>,
    pub total_chunks: f64,
}

impl LaneChoices {
    /// Zero-weight snapshot so selection works before the first tick.
    pub fn initial(ips: &[IpAddr]) -> Self {
        let probe = ips.iter().map(|&ip| ProbeEntry { ip, weight: 0.0 }).collect();
        let chunks = ips
            .iter()
            .flat_map(|&ip| {
                (0..crate::config::COMMON_CLIENTS as u8).map(move |slot| ChunkEntry {
                    ip,
                    slot,
                    weight: 0.0,
                })
            })
            .collect();
        Self {
            probe,
            total_probe: 0.0,
            chunks,
            total_chunks: 0.0,
        }
    }

    /// Weighted draw over the probe lane. A zero or exhausted total falls
    /// back to the last entry, deterministically.
    pub fn pick_probe(&self) -> Option<IpAddr> {
        let last = self.probe.last()?;
        if self.total_probe <= 0.0 {
            return Some(last.ip);
        }
        let target = rand::rng().random_range(0.0..self.total_probe);
        let mut acc = 0.0;
        for entry in &self.probe {
            acc += entry.weight;
            if target < acc {
                return Some(entry.ip);
            }
        }
        Some(last.ip)
    }
}

/// Published snapshot cell; replace-the-pointer semantics.
pub struct ChoiceCell(ArcSwap<LaneChoices>);

impl ChoiceCell {
    pub fn new(initial: LaneChoices) -> Self {
        Self(ArcSwap::from_pointee(initial))
    }

    pub fn load(&self) -> Arc<LaneChoices> {
        self.0.load_full()
    }

    pub fn store(&self, snapshot: LaneChoices) {
        self.0.store(Arc::new(snapshot));
    }
}

/// Startup measurements for one interface, produced by the speed test.
#[derive(Debug, Clone)]
pub struct NicProfile {
    pub name: String,
    pub ping_ms: i64,
    pub low_avg: f64,
    pub standard: f64,
    pub fastest: f64,
    pub best_chunk: u64,
}

/// Per-tick dashboard card.
#[derive(Debug, Clone, Serialize, Default)]
pub struct NicCard {
    pub ip: String,
    pub standard_speed: f64,
    pub now_speed: f64,
    pub probe_speed: f64,
    pub chunk0_speed: f64,
    pub chunk1_speed: f64,
}

struct NicTrack {
    ip: IpAddr,
    last: [u64; 3],
    low_avg: f64,
    standard: f64,
    fastest: f64,
}

/// Periodically re-derives each interface's smoothed capacity from the byte
/// ledger and publishes fresh selection probabilities.
pub struct CapacityModel {
    nics: Vec<NicTrack>,
    last_tick: Instant,
    ledger: Arc<ByteLedger>,
    choices: Arc<ChoiceCell>,
    cards_tx: watch::Sender<Vec<NicCard>>,
}

impl CapacityModel {
    pub fn new(
        profiles: &HashMap<IpAddr, NicProfile>,
        ledger: Arc<ByteLedger>,
        choices: Arc<ChoiceCell>,
        cards_tx: watch::Sender<Vec<NicCard>>,
    ) -> Self {
        let nics = profiles
            .iter()
            .map(|(&ip, p)| NicTrack {
                ip,
                last: [0; 3],
                low_avg: p.low_avg,
                standard: p.standard,
                fastest: p.fastest,
            })
            .collect();
        Self {
            nics,
            last_tick: Instant::now(),
            ledger,
            choices,
            cards_tx,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("capacity model stopped");
                    return;
                }
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    fn tick(&mut self) {
        let elapsed = self.last_tick.elapsed().as_secs_f64();
        self.last_tick = Instant::now();
        if elapsed <= 0.0 {
            return;
        }

        let mut probe_entries = Vec::with_capacity(self.nics.len());
        let mut chunk_entries = Vec::with_capacity(self.nics.len() * 2);
        let mut total_probe = 0.0;
        let mut total_chunks = 0.0;
        let mut cards = Vec::with_capacity(self.nics.len());

        for nic in &mut self.nics {
            let now = [
                self.ledger.get(nic.ip, Lane::Probe),
                self.ledger.get(nic.ip, Lane::Common(0)),
                self.ledger.get(nic.ip, Lane::Common(1)),
            ];
            let probe_sp = (now[0].saturating_sub(nic.last[0])) as f64 / (elapsed * MB);
            let chunk0_sp = (now[1].saturating_sub(nic.last[1])) as f64 / (elapsed * MB);
            let chunk1_sp = (now[2].saturating_sub(nic.last[2])) as f64 / (elapsed * MB);
            nic.last = now;

            let speed_nic = probe_sp + chunk0_sp + chunk1_sp;
            if speed_nic > nic.fastest {
                nic.fastest = speed_nic;
            }

            nic.standard = smooth_standard(
                nic.standard,
                speed_nic,
                nic.low_avg,
                nic.fastest,
                CHECK_INTERVAL.as_secs_f64() / 10.0,
            );

            let [probe_w, chunk0_w, chunk1_w] =
                lane_weights(nic.standard, speed_nic, probe_sp, chunk0_sp, chunk1_sp);

            probe_entries.push(ProbeEntry {
                ip: nic.ip,
                weight: probe_w,
            });
            chunk_entries.push(ChunkEntry {
                ip: nic.ip,
                slot: 0,
                weight: chunk0_w,
            });
            chunk_entries.push(ChunkEntry {
                ip: nic.ip,
                slot: 1,
                weight: chunk1_w,
            });
            total_probe += probe_w;
            total_chunks += chunk0_w + chunk1_w;

            cards.push(NicCard {
                ip: nic.ip.to_string(),
                standard_speed: nic.standard,
                now_speed: speed_nic,
                probe_speed: probe_sp,
                chunk0_speed: chunk0_sp,
                chunk1_speed: chunk1_sp,
            });
        }

        self.choices.store(LaneChoices {
            probe: probe_entries,
            total_probe,
            chunks: chunk_entries,
            total_chunks,
        });
        let _ = self.cards_tx.send(cards);
    }
}

/// Move the smoothed standard speed toward `low_avg` (when overestimating)
/// or toward `fastest` (when underestimating). The exponential updater maps
/// `x in [-1, 0]` onto `[0, 1]`, damping outliers and accelerating as the
/// observation approaches the asymptote. Idle interfaces
/// (`speed <= low_avg/3`) keep their estimate.
pub fn smooth_standard(standard: f64, speed: f64, low_avg: f64, fastest: f64, alpha: f64) -> f64 {
    if speed <= low_avg / 3.0 {
        return standard;
    }
    if standard > speed {
        if standard > 0.0 {
            let x = (standard - speed) / standard - 1.0;
            standard + (low_avg - standard) * alpha * updater(x)
        } else {
            standard
        }
    } else if fastest > standard {
        let x = (speed - standard) / (fastest - standard) - 1.0;
        standard + (fastest - standard) * alpha * updater(x)
    } else {
        standard
    }
}

fn updater(x: f64) -> f64 {
    let e_neg1 = (-1.0f64).exp();
    (x.exp() - e_neg1) / (1.0 - e_neg1)
}

/// Selection weights for the three lanes of one interface. The squared term
/// biases toward under-utilized lanes.
pub fn lane_weights(
    standard: f64,
    speed_nic: f64,
    probe_sp: f64,
    chunk0_sp: f64,
    chunk1_sp: f64,
) -> [f64; 3] {
    let base = standard.max(speed_nic);
    let raw = [
        weight_of(standard, probe_sp, base - chunk0_sp - chunk1_sp),
        weight_of(standard, chunk0_sp, base - chunk1_sp - probe_sp),
        weight_of(standard, chunk1_sp, base - probe_sp - chunk0_sp),
    ];
    raw.map(|w| w.max(0.0))
}

fn weight_of(base: f64, speed: f64, divisor: f64) -> f64 {
    if divisor == 0.0 {
        return base;
    }
    let ratio = 1.0 - speed / divisor;
    base * ratio * ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updater_maps_unit_interval() {
        assert!(updater(-1.0).abs() < 1e-12);
        assert!((updater(0.0) - 1.0).abs() < 1e-12);
        assert!(updater(-0.5) > 0.0 && updater(-0.5) < 1.0);
    }

    #[test]
    fn idle_interface_keeps_estimate() {
        let s = smooth_standard(40.0, 1.0, 30.0, 80.0, 0.05);
        assert!((s - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overestimate_contracts_toward_low_avg() {
        let s = smooth_standard(60.0, 30.0, 25.0, 80.0, 0.05);
        assert!(s < 60.0);
        assert!(s > 25.0);
    }

    #[test]
    fn underestimate_expands_toward_fastest() {
        let s = smooth_standard(30.0, 50.0, 25.0, 80.0, 0.05);
        assert!(s > 30.0);
        assert!(s < 80.0);
    }

    #[test]
    fn weights_are_never_negative() {
        for weights in [
            lane_weights(40.0, 70.0, 60.0, 5.0, 5.0),
            lane_weights(40.0, 10.0, 2.0, 4.0, 4.0),
            lane_weights(0.0, 0.0, 0.0, 0.0, 0.0),
        ] {
            for w in weights {
                assert!(w >= 0.0);
            }
        }
    }

    #[test]
    fn busy_lane_gets_less_weight() {
        let [probe, chunk0, _] = lane_weights(40.0, 30.0, 25.0, 5.0, 0.0);
        assert!(probe < chunk0);
    }

    #[test]
    fn zero_total_falls_back_to_last_entry() {
        let ips: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let choices = LaneChoices::initial(&ips);
        assert_eq!(choices.total_probe, 0.0);
        for _ in 0..8 {
            assert_eq!(choices.pick_probe(), Some(ips[1]));
        }
    }

    #[test]
    fn snapshot_totals_match_entry_sums() {
        let ips: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap()];
        let ledger = Arc::new(ByteLedger::new(ips.clone()));
        let choices = Arc::new(ChoiceCell::new(LaneChoices::initial(&ips)));
        let (tx, _rx) = watch::channel(Vec::new());

        let mut profiles = HashMap::new();
        profiles.insert(
            ips[0],
            NicProfile {
                name: "eth0".to_string(),
                ping_ms: 10,
                low_avg: 20.0,
                standard: 40.0,
                fastest: 60.0,
                best_chunk: 8 * 1024 * 1024,
            },
        );

        let mut model = CapacityModel::new(&profiles, ledger.clone(), choices.clone(), tx);
        ledger.add(ips[0], Lane::Probe, 50 * 1024 * 1024);
        ledger.add(ips[0], Lane::Common(0), 20 * 1024 * 1024);
        // Pretend half a second passed.
        model.last_tick = Instant::now() - CHECK_INTERVAL;
        model.tick();

        let snap = choices.load();
        let sum_probe: f64 = snap.probe.iter().map(|e| e.weight).sum();
        let sum_chunks: f64 = snap.chunks.iter().map(|e| e.weight).sum();
        assert!((snap.total_probe - sum_probe).abs() < 1e-9);
        assert!((snap.total_chunks - sum_chunks).abs() < 1e-9);
        assert_eq!(snap.chunks.len(), 2);
    }
}
