//! One decision cycle: pressure demotion, cold demotion, promotion.
//!
//! The cycle is a pure function of its inputs. Destination writes are
//! charged cumulatively against projected free space; space freed by a
//! planned move is never credited back within the same cycle.

use super::plan::{FlagReason, FlaggedPath, Plan, PlannedMove, Rejection};
use crate::config::{TierPolicy, TieringConfig};
use crate::drives::{Drive, DriveId, Tier};
use crate::index::{LogicalPath, PlacementRecord, PlacementState};
use crate::migration::MigrationReason;
use crate::temperature::TemperatureSnapshot;
use crate::Result;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Everything a cycle looks at, captured at one instant.
#[derive(Debug, Clone, Default)]
pub struct PolicyInput {
    pub drives: Vec<Drive>,
    pub temperatures: TemperatureSnapshot,
    pub placements: Vec<PlacementRecord>,
    /// Paths with an active, pending or exhausted task.
    pub blocked: HashSet<LogicalPath>,
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    policies: HashMap<Tier, TierPolicy>,
    reserve_bytes: u64,
    exclude: Vec<Regex>,
}

struct Candidate<'a> {
    record: &'a PlacementRecord,
    temperature: f64,
}

/// Mutable projection of capacity during one cycle.
struct Projection<'a> {
    drives: Vec<&'a Drive>,
    free: HashMap<DriveId, u64>,
    /// Per tier: bytes in use plus bytes planned to arrive.
    load: HashMap<Tier, u64>,
    capacity: HashMap<Tier, u64>,
    /// Per tier: bytes planned to leave. Only used to stop pressure demotion.
    shed: HashMap<Tier, u64>,
}

impl<'a> Projection<'a> {
    fn new(drives: &'a [Drive]) -> Self {
        let online: Vec<&Drive> = drives.iter().filter(|d| d.is_online()).collect();
        let mut load = HashMap::new();
        let mut capacity = HashMap::new();
        let mut free = HashMap::new();
        for drive in &online {
            *load.entry(drive.tier).or_insert(0) += drive.used_bytes();
            *capacity.entry(drive.tier).or_insert(0) += drive.total_bytes;
            free.insert(drive.id.clone(), drive.free_bytes);
        }
        Self {
            drives: online,
            free,
            load,
            capacity,
            shed: HashMap::new(),
        }
    }

    fn capacity(&self, tier: Tier) -> u64 {
        self.capacity.get(&tier).copied().unwrap_or(0)
    }

    fn ratio(&self, tier: Tier) -> f64 {
        let capacity = self.capacity(tier);
        if capacity == 0 {
            return 0.0;
        }
        let load = self.load.get(&tier).copied().unwrap_or(0);
        let shed = self.shed.get(&tier).copied().unwrap_or(0);
        load.saturating_sub(shed) as f64 / capacity as f64
    }

    /// Would `size` more bytes keep `tier` at or under `limit`?
    fn has_headroom(&self, tier: Tier, size: u64, limit: f64) -> bool {
        let capacity = self.capacity(tier);
        if capacity == 0 {
            return false;
        }
        let load = self.load.get(&tier).copied().unwrap_or(0) + size;
        load as f64 / capacity as f64 <= limit
    }

    /// The drive of `tier` with the most projected free space, and whether
    /// it fits `needed` bytes.
    fn best_drive(&self, tier: Tier, needed: u64) -> Option<(DriveId, u64, bool)> {
        self.drives
            .iter()
            .filter(|d| d.tier == tier)
            .map(|d| {
                let free = self.free.get(&d.id).copied().unwrap_or(0);
                (d.id.clone(), free)
            })
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(id, free)| (id, free, free >= needed))
    }

    fn charge(&mut self, dest: &DriveId, to_tier: Tier, from_tier: Tier, size: u64) {
        if let Some(free) = self.free.get_mut(dest) {
            *free = free.saturating_sub(size);
        }
        *self.load.entry(to_tier).or_insert(0) += size;
        *self.shed.entry(from_tier).or_insert(0) += size;
    }
}

impl PolicyEngine {
    pub fn new(policies: Vec<TierPolicy>, reserve_bytes: u64, exclude: Vec<Regex>) -> Self {
        let mut by_tier: HashMap<Tier, TierPolicy> = Tier::ALL
            .iter()
            .map(|t| (*t, TierPolicy::defaults_for(*t)))
            .collect();
        for policy in policies {
            by_tier.insert(policy.tier, policy);
        }
        Self {
            policies: by_tier,
            reserve_bytes,
            exclude,
        }
    }

    pub fn from_config(config: &TieringConfig) -> Result<Self> {
        Ok(Self::new(
            Tier::ALL.iter().map(|t| config.policy_for(*t)).collect(),
            config.migration.reserve_bytes,
            config.exclude_patterns()?,
        ))
    }

    fn policy(&self, tier: Tier) -> TierPolicy {
        self.policies
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierPolicy::defaults_for(tier))
    }

    fn is_excluded(&self, path: &LogicalPath) -> bool {
        self.exclude.iter().any(|re| re.is_match(path.as_str()))
    }

    /// Run one decision cycle.
    pub fn plan(&self, input: &PolicyInput) -> Plan {
        let mut plan = Plan::default();
        let known: HashMap<&DriveId, &Drive> = input.drives.iter().map(|d| (&d.id, d)).collect();
        let recorded: HashSet<&LogicalPath> = input.placements.iter().map(|r| &r.path).collect();

        let mut eligible: Vec<Candidate<'_>> = Vec::new();
        for record in &input.placements {
            if input.blocked.contains(&record.path) {
                continue;
            }
            let flag = match record.state {
                PlacementState::Orphaned => Some(FlagReason::Orphaned),
                PlacementState::Migrating => Some(FlagReason::MigratingWithoutTask),
                PlacementState::Stable if !known.contains_key(&record.drive_id) => {
                    Some(FlagReason::UnknownDrive)
                }
                PlacementState::Stable => None,
            };
            if let Some(reason) = flag {
                plan.flagged.push(FlaggedPath {
                    path: record.path.clone(),
                    reason,
                });
                continue;
            }
            let online = known
                .get(&record.drive_id)
                .is_some_and(|d| d.is_online());
            if !online || self.is_excluded(&record.path) {
                continue;
            }
            eligible.push(Candidate {
                record,
                temperature: input.temperatures.file(&record.path),
            });
        }

        let mut orphan_temps: Vec<&LogicalPath> = input
            .temperatures
            .files
            .keys()
            .filter(|p| !recorded.contains(p))
            .collect();
        orphan_temps.sort();
        for path in orphan_temps {
            plan.flagged.push(FlaggedPath {
                path: path.clone(),
                reason: FlagReason::TemperatureWithoutRecord,
            });
        }

        let mut projection = Projection::new(&input.drives);
        let mut chosen: HashSet<LogicalPath> = HashSet::new();

        self.pressure_demotions(&eligible, &mut projection, &mut chosen, &mut plan);
        self.cold_demotions(&eligible, &mut projection, &mut chosen, &mut plan);
        self.promotions(&eligible, &mut projection, &mut chosen, &mut plan);

        debug!(
            "Policy cycle: {} moves, {} rejected, {} flagged",
            plan.moves.len(),
            plan.rejections.len(),
            plan.flagged.len()
        );
        plan
    }

    fn pressure_demotions(
        &self,
        eligible: &[Candidate<'_>],
        projection: &mut Projection<'_>,
        chosen: &mut HashSet<LogicalPath>,
        plan: &mut Plan,
    ) {
        for tier in Tier::ALL {
            let policy = self.policy(tier);
            if tier.slower().is_none() || projection.ratio(tier) <= policy.high_watermark {
                continue;
            }
            debug!(
                "Tier {} above high watermark ({:.2} > {:.2})",
                tier,
                projection.ratio(tier),
                policy.high_watermark
            );

            let mut candidates: Vec<&Candidate<'_>> = eligible
                .iter()
                .filter(|c| c.record.tier == tier && !chosen.contains(&c.record.path))
                .collect();
            candidates.sort_by(coldest_first);

            for candidate in candidates {
                if projection.ratio(tier) <= policy.low_watermark {
                    break;
                }
                let needed = candidate.record.size + self.reserve_bytes;
                let mut rejection = None;
                let mut placed = false;
                for to_tier in tier.slower_tiers() {
                    match projection.best_drive(to_tier, needed) {
                        Some((dest, _, true)) => {
                            self.accept(
                                candidate,
                                dest,
                                to_tier,
                                MigrationReason::Demote,
                                projection,
                                chosen,
                                plan,
                            );
                            placed = true;
                            break;
                        }
                        Some((dest, free, false)) => {
                            rejection.get_or_insert(Rejection {
                                path: candidate.record.path.clone(),
                                to_tier,
                                needed,
                                available: free,
                                drive_id: Some(dest),
                            });
                        }
                        None => {}
                    }
                }
                if !placed {
                    if let Some(rejection) = rejection {
                        plan.rejections.push(rejection);
                    }
                }
            }
        }
    }

    fn cold_demotions(
        &self,
        eligible: &[Candidate<'_>],
        projection: &mut Projection<'_>,
        chosen: &mut HashSet<LogicalPath>,
        plan: &mut Plan,
    ) {
        for tier in Tier::ALL {
            let (Some(threshold), Some(to_tier)) = (self.policy(tier).demote_threshold, tier.slower())
            else {
                continue;
            };
            let limit = self.policy(to_tier).high_watermark;

            let mut candidates: Vec<&Candidate<'_>> = eligible
                .iter()
                .filter(|c| {
                    c.record.tier == tier
                        && c.temperature < threshold
                        && !chosen.contains(&c.record.path)
                })
                .collect();
            candidates.sort_by(coldest_first);

            for candidate in candidates {
                if !projection.has_headroom(to_tier, candidate.record.size, limit) {
                    continue;
                }
                self.place(candidate, to_tier, MigrationReason::Demote, projection, chosen, plan);
            }
        }
    }

    fn promotions(
        &self,
        eligible: &[Candidate<'_>],
        projection: &mut Projection<'_>,
        chosen: &mut HashSet<LogicalPath>,
        plan: &mut Plan,
    ) {
        for tier in Tier::ALL {
            let Some(to_tier) = tier.faster() else {
                continue;
            };
            let target = self.policy(to_tier);
            let Some(threshold) = target.promote_threshold else {
                continue;
            };

            let mut candidates: Vec<&Candidate<'_>> = eligible
                .iter()
                .filter(|c| {
                    c.record.tier == tier
                        && c.temperature >= threshold
                        && !chosen.contains(&c.record.path)
                })
                .collect();
            candidates.sort_by(hottest_first);

            for candidate in candidates {
                if !projection.has_headroom(to_tier, candidate.record.size, target.high_watermark) {
                    continue;
                }
                self.place(candidate, to_tier, MigrationReason::Promote, projection, chosen, plan);
            }
        }
    }

    fn place(
        &self,
        candidate: &Candidate<'_>,
        to_tier: Tier,
        reason: MigrationReason,
        projection: &mut Projection<'_>,
        chosen: &mut HashSet<LogicalPath>,
        plan: &mut Plan,
    ) {
        let needed = candidate.record.size + self.reserve_bytes;
        match projection.best_drive(to_tier, needed) {
            Some((dest, _, true)) => {
                self.accept(candidate, dest, to_tier, reason, projection, chosen, plan)
            }
            Some((dest, free, false)) => plan.rejections.push(Rejection {
                path: candidate.record.path.clone(),
                to_tier,
                needed,
                available: free,
                drive_id: Some(dest),
            }),
            None => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn accept(
        &self,
        candidate: &Candidate<'_>,
        dest: DriveId,
        to_tier: Tier,
        reason: MigrationReason,
        projection: &mut Projection<'_>,
        chosen: &mut HashSet<LogicalPath>,
        plan: &mut Plan,
    ) {
        let record = candidate.record;
        projection.charge(&dest, to_tier, record.tier, record.size);
        chosen.insert(record.path.clone());
        plan.moves.push(PlannedMove {
            path: record.path.clone(),
            source: record.drive_id.clone(),
            dest,
            from_tier: record.tier,
            to_tier,
            size: record.size,
            temperature: candidate.temperature,
            reason,
        });
    }
}

/// Coldest first; ties by largest size, then path.
fn coldest_first(a: &&Candidate<'_>, b: &&Candidate<'_>) -> Ordering {
    a.temperature
        .total_cmp(&b.temperature)
        .then_with(|| b.record.size.cmp(&a.record.size))
        .then_with(|| a.record.path.cmp(&b.record.path))
}

/// Hottest first; ties by largest size, then path.
fn hottest_first(a: &&Candidate<'_>, b: &&Candidate<'_>) -> Ordering {
    b.temperature
        .total_cmp(&a.temperature)
        .then_with(|| b.record.size.cmp(&a.record.size))
        .then_with(|| a.record.path.cmp(&b.record.path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drives::DriveHealth;

    const GB: u64 = 1_000_000_000;

    fn path(p: &str) -> LogicalPath {
        LogicalPath::new(p).unwrap()
    }

    fn record(p: &str, drive: &str, tier: Tier, size: u64) -> PlacementRecord {
        PlacementRecord::observed(path(p), DriveId::from(drive), tier, size, 0)
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Vec::new(), 0, Vec::new())
    }

    fn input(drives: Vec<Drive>, placements: Vec<PlacementRecord>) -> PolicyInput {
        PolicyInput {
            drives,
            placements,
            ..Default::default()
        }
    }

    fn with_temps(mut input: PolicyInput, temps: &[(&str, f64)]) -> PolicyInput {
        for (p, t) in temps {
            input.temperatures.files.insert(path(p), *t);
        }
        input
    }

    #[test]
    fn test_pressure_demotes_coldest_until_low_watermark() {
        let drives = vec![
            Drive::new("a", "/mnt/a", Tier::Fast).with_capacity(100 * GB, 5 * GB),
            Drive::new("b", "/mnt/b", Tier::Slow).with_capacity(1000 * GB, 800 * GB),
        ];
        let placements = vec![
            record("cold-big", "a", Tier::Fast, 10 * GB),
            record("cold-small", "a", Tier::Fast, 5 * GB),
            record("warm", "a", Tier::Fast, 10 * GB),
            record("hot", "a", Tier::Fast, 10 * GB),
        ];
        let input = with_temps(
            input(drives, placements),
            &[("cold-big", 1.0), ("cold-small", 1.0), ("warm", 2.0), ("hot", 9.0)],
        );

        let plan = engine().plan(&input);
        let moved: Vec<&str> = plan.moves.iter().map(|m| m.path.as_str()).collect();
        // 95 GB used, low watermark 75 GB: 10 + 5 + 10 leaves 70 GB.
        assert_eq!(moved, vec!["cold-big", "cold-small", "warm"]);
        assert!(plan.moves.iter().all(|m| m.dest.as_str() == "b"));
        assert!(plan.moves.iter().all(|m| m.reason == MigrationReason::Demote));
    }

    #[test]
    fn test_cold_demotion_without_pressure() {
        let drives = vec![
            Drive::new("a", "/mnt/a", Tier::Fast).with_capacity(100 * GB, 50 * GB),
            Drive::new("b", "/mnt/b", Tier::Slow).with_capacity(1000 * GB, 800 * GB),
        ];
        let input = with_temps(
            input(
                drives,
                vec![record("f", "a", Tier::Fast, GB), record("g", "a", Tier::Fast, GB)],
            ),
            &[("g", 1.0)],
        );

        let plan = engine().plan(&input);
        assert_eq!(plan.moves.len(), 1);
        assert_eq!(plan.moves[0].path.as_str(), "f");
        assert_eq!(plan.moves[0].to_tier, Tier::Slow);
    }

    #[test]
    fn test_promotion_one_tier_hottest_first_with_headroom() {
        let drives = vec![
            Drive::new("a", "/mnt/a", Tier::Fast).with_capacity(100 * GB, 20 * GB),
            Drive::new("b", "/mnt/b", Tier::Slow).with_capacity(1000 * GB, 500 * GB),
            Drive::new("c", "/mnt/c", Tier::Archival).with_capacity(1000 * GB, 500 * GB),
        ];
        let placements = vec![
            record("hot1", "b", Tier::Slow, 3 * GB),
            record("hot2", "b", Tier::Slow, 3 * GB),
            record("hot3", "b", Tier::Slow, 3 * GB),
            record("archived", "c", Tier::Archival, GB),
        ];
        let input = with_temps(
            input(drives, placements),
            &[("hot1", 5.0), ("hot2", 8.0), ("hot3", 4.0), ("archived", 10.0)],
        );

        let plan = engine().plan(&input);
        let promoted: Vec<(&str, Tier)> = plan
            .moves
            .iter()
            .map(|m| (m.path.as_str(), m.to_tier))
            .collect();
        // Fast is at 80 GB with an 85 GB high watermark: room for one 3 GB file.
        assert_eq!(
            promoted,
            vec![("hot2", Tier::Fast), ("archived", Tier::Slow)]
        );
    }

    #[test]
    fn test_cumulative_writes_never_exceed_free_space() {
        let drives = vec![
            Drive::new("a", "/mnt/a", Tier::Fast).with_capacity(100 * GB, 0),
            Drive::new("b1", "/mnt/b1", Tier::Slow).with_capacity(100 * GB, 12 * GB),
            Drive::new("b2", "/mnt/b2", Tier::Slow).with_capacity(100 * GB, 8 * GB),
        ];
        let placements: Vec<PlacementRecord> = (0..10)
            .map(|i| record(&format!("f{}", i), "a", Tier::Fast, 5 * GB))
            .collect();
        let engine = PolicyEngine::new(Vec::new(), GB, Vec::new());

        let plan = engine.plan(&input(drives.clone(), placements));
        let writes = plan.writes_per_drive();
        for drive in &drives {
            assert!(writes.get(&drive.id).copied().unwrap_or(0) <= drive.free_bytes);
        }
        // b1 takes two (12 -> 7 -> 2), b2 takes one (8 -> 3).
        assert_eq!(plan.moves.len(), 3);
        assert!(!plan.rejections.is_empty());
        assert!(matches!(
            plan.rejections[0].to_error(),
            crate::TierError::CapacityExceeded { .. }
        ));
    }

    #[test]
    fn test_pressure_falls_through_to_slower_tier() {
        let drives = vec![
            Drive::new("a", "/mnt/a", Tier::Fast).with_capacity(100 * GB, 0),
            Drive::new("b", "/mnt/b", Tier::Slow).with_capacity(100 * GB, GB),
            Drive::new("c", "/mnt/c", Tier::Archival).with_capacity(1000 * GB, 900 * GB),
        ];
        let plan = engine().plan(&input(drives, vec![record("f", "a", Tier::Fast, 30 * GB)]));
        assert_eq!(plan.moves.len(), 1);
        assert_eq!(plan.moves[0].dest.as_str(), "c");
    }

    #[test]
    fn test_blocked_and_inconsistent_paths_are_skipped() {
        let drives = vec![
            Drive::new("a", "/mnt/a", Tier::Fast).with_capacity(100 * GB, 50 * GB),
            Drive::new("b", "/mnt/b", Tier::Slow).with_capacity(1000 * GB, 800 * GB),
        ];
        let mut orphan = record("orphan", "a", Tier::Fast, GB);
        orphan.state = PlacementState::Orphaned;
        let mut stuck = record("stuck", "a", Tier::Fast, GB);
        stuck.state = PlacementState::Migrating;
        let placements = vec![
            record("busy", "a", Tier::Fast, GB),
            orphan,
            stuck,
            record("lost", "gone", Tier::Fast, GB),
        ];
        let mut input = with_temps(input(drives, placements), &[("ghost", 1.0)]);
        input.blocked.insert(path("busy"));

        let plan = engine().plan(&input);
        assert!(plan.moves.is_empty());
        let reasons: Vec<FlagReason> = plan.flagged.iter().map(|f| f.reason).collect();
        assert_eq!(
            reasons,
            vec![
                FlagReason::Orphaned,
                FlagReason::MigratingWithoutTask,
                FlagReason::UnknownDrive,
                FlagReason::TemperatureWithoutRecord,
            ]
        );
    }

    #[test]
    fn test_offline_destination_not_used() {
        let mut b = Drive::new("b", "/mnt/b", Tier::Slow).with_capacity(1000 * GB, 800 * GB);
        b.health = DriveHealth::Offline;
        let drives = vec![
            Drive::new("a", "/mnt/a", Tier::Fast).with_capacity(100 * GB, 50 * GB),
            b,
        ];
        let plan = engine().plan(&input(drives, vec![record("f", "a", Tier::Fast, GB)]));
        assert!(plan.moves.is_empty());
    }

    #[test]
    fn test_excluded_paths_never_planned() {
        let drives = vec![
            Drive::new("a", "/mnt/a", Tier::Fast).with_capacity(100 * GB, 50 * GB),
            Drive::new("b", "/mnt/b", Tier::Slow).with_capacity(1000 * GB, 800 * GB),
        ];
        let engine = PolicyEngine::new(Vec::new(), 0, vec![Regex::new(r"^db/").unwrap()]);
        let plan = engine.plan(&input(drives, vec![record("db/pg.dat", "a", Tier::Fast, GB)]));
        assert!(plan.moves.is_empty());
    }

    #[test]
    fn test_unchanged_inputs_after_completion_plan_nothing() {
        let drives = vec![
            Drive::new("a", "/mnt/a", Tier::Fast).with_capacity(100 * GB, 60 * GB),
            Drive::new("b", "/mnt/b", Tier::Slow).with_capacity(1000 * GB, 800 * GB),
        ];
        let input = with_temps(
            input(drives, vec![record("f", "a", Tier::Fast, GB)]),
            &[("f", 0.1)],
        );
        let plan = engine().plan(&input);
        assert_eq!(plan.moves.len(), 1);

        // Apply the plan as the executor would.
        let mut after = input.clone();
        for m in &plan.moves {
            let rec = after
                .placements
                .iter_mut()
                .find(|r| r.path == m.path)
                .unwrap();
            rec.drive_id = m.dest.clone();
            rec.tier = m.to_tier;
        }
        after.drives[0].free_bytes += GB;
        after.drives[1].free_bytes -= GB;

        let again = engine().plan(&after);
        assert!(again.moves.is_empty());
        assert_eq!(engine().plan(&after), again);
    }
}
