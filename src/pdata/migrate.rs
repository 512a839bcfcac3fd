use super::decomposition::DomainDecomposition;
use super::error::Error;
use super::signals::ParticleMove;
use super::{ParticleData, ROOT};
use crate::comm::{Communicator, CommunicatorExt, MessageTag};
use crate::model::packed::PackedParticle;
use crate::model::types::{NO_DESTINATION, Tag, Vec3};
use log::{debug, trace, warn};

/// Point-to-point channel for single-particle relocation.
const RELOCATE: MessageTag = MessageTag::User(1);

/// Outcome of one [`ParticleData::migrate`] round on the calling rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub sent: usize,
    pub received: usize,
}

impl<C: Communicator> ParticleData<C> {
    /// Packs and removes every local particle whose communication flag names
    /// a destination, returning `(destination, record)` pairs in slot order.
    ///
    /// Survivors keep their relative order. Ghosts are discarded first.
    pub fn remove_particles(&mut self) -> Vec<(u32, PackedParticle)> {
        self.remove_all_ghost_particles();
        let n_old = self.arrays.n_local();
        if self.arrays.comm_flags()[..n_old]
            .iter()
            .all(|&flag| flag == NO_DESTINATION)
        {
            return Vec::new();
        }

        let mut leaving = Vec::new();
        let mut n_kept = 0;
        {
            let (live, scratch, flags) = self.arrays.compaction_buffers();
            for (idx, flag) in flags[..n_old].iter_mut().enumerate() {
                if *flag == NO_DESTINATION {
                    scratch.copy_from(n_kept, live, idx);
                    n_kept += 1;
                } else {
                    leaving.push((*flag, live.pack(idx)));
                    *flag = NO_DESTINATION;
                }
            }
        }
        self.arrays.swap_buffers();
        self.resize_local(n_kept);

        for (_, record) in &leaving {
            self.tags.clear_slot(record.tag);
        }
        self.tags.assign_slots(&self.arrays.front().tag[..n_kept], 0);
        self.signals.particle_sort.emit(&());
        leaving
    }

    /// Appends `records` after the local particles. Ghosts are discarded
    /// first.
    ///
    /// Every record must carry an issued tag; otherwise nothing is added.
    pub fn add_particles(&mut self, records: &[PackedParticle]) -> Result<(), Error> {
        if let Some(record) = records.iter().find(|r| !self.tags.is_issued(r.tag)) {
            return Err(Error::UnknownTag {
                tag: record.tag,
                maximum: self.tags.maximum_tag(),
            });
        }
        self.remove_all_ghost_particles();
        let n_old = self.arrays.n_local();
        let n_new = n_old + records.len();
        self.resize_local(n_new);

        let (arrays, flags) = self.arrays.front_and_flags_mut();
        for (idx, record) in (n_old..n_new).zip(records) {
            arrays.unpack(idx, record);
            flags[idx] = NO_DESTINATION;
        }
        self.tags.assign_slots(&self.arrays.front().tag[..n_new], 0);
        self.signals.particle_sort.emit(&());
        Ok(())
    }

    /// Sends every particle that left the local domain to its new owner.
    ///
    /// Positions are wrapped into the global box first. Without a
    /// decomposition this does nothing. Collective.
    pub fn migrate(&mut self) -> Result<MigrationSummary, Error> {
        let Some(decomposition) = self.decomposition else {
            return Ok(MigrationSummary::default());
        };
        let flagged = self.flag_departures(&decomposition);
        let sent = match self.agree(flagged, "migration") {
            Ok(sent) => sent,
            Err(e) => {
                self.comm_flags_mut().fill(NO_DESTINATION);
                return Err(e);
            }
        };

        let me = self.comm.rank();
        let mut outgoing = vec![Vec::new(); self.comm.size() as usize];
        for (dest, record) in self.remove_particles() {
            self.signals.particle_moved.emit(&ParticleMove {
                tag: record.tag,
                from: me,
                to: dest,
            });
            outgoing[dest as usize].push(record);
        }

        let incoming = self.comm.all_to_all_pod(outgoing)?;
        let mut arrived = Vec::new();
        for (source, records) in (0u32..).zip(incoming) {
            for record in &records {
                self.signals.particle_moved.emit(&ParticleMove {
                    tag: record.tag,
                    from: source,
                    to: me,
                });
            }
            arrived.extend(records);
        }
        self.add_particles(&arrived)?;

        debug!(
            "rank {me}: migrated {sent} particles out, {} in, {} now local",
            arrived.len(),
            self.arrays.n_local()
        );
        Ok(MigrationSummary {
            sent,
            received: arrived.len(),
        })
    }

    /// Wraps local positions and flags particles owned by another rank.
    /// Returns the number flagged; on failure no flags are left set.
    fn flag_departures(&mut self, decomposition: &DomainDecomposition) -> Result<usize, Error> {
        let global_box = self.global_box;
        let me = self.comm.rank();
        let n = self.arrays.n_local();
        let (arrays, flags) = self.arrays.front_and_flags_mut();

        let mut flagged = 0;
        for idx in 0..n {
            let mut pos = arrays.pos[idx].position;
            let mut image = arrays.image[idx];
            global_box.wrap(&mut pos, &mut image);
            let Some(dest) = decomposition.place_and_wrap(&global_box, &mut pos, &mut image)
            else {
                flags[..n].fill(NO_DESTINATION);
                let tag = arrays.tag[idx];
                warn!("rank {me}: particle {tag} at {pos:?} has no home rank");
                return Err(Error::placement(tag, pos, global_box.make_fraction(pos)));
            };
            arrays.pos[idx].position = pos;
            arrays.image[idx] = image;
            if dest != me {
                flags[idx] = dest;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    /// Sets a particle's position, wrapped into the global box with its
    /// image updated.
    ///
    /// With `move_particle` and a decomposition, a particle whose new
    /// position belongs to another rank is handed to that rank immediately.
    /// Collective.
    pub fn set_position(&mut self, tag: Tag, position: Vec3, move_particle: bool) -> Result<(), Error> {
        let slot = self.lookup(tag)?;
        let owner = self.owner_rank(tag)?;

        let global_box = self.global_box;
        let mut pos = position;
        let mut image = slot.map_or([0; 3], |idx| self.arrays.front().image[idx]);
        global_box.wrap(&mut pos, &mut image);

        let target = match self.decomposition.filter(|_| move_particle) {
            Some(decomposition) => Some(decomposition.place_and_wrap(&global_box, &mut pos, &mut image)),
            None => None,
        };
        if let Some(idx) = slot {
            let arrays = self.arrays.front_mut();
            arrays.pos[idx].position = pos;
            arrays.image[idx] = image;
        }
        let Some(target) = target else {
            return Ok(());
        };

        let target = self.comm.broadcast_pod(ROOT, target.unwrap_or(NO_DESTINATION))?;
        if target == NO_DESTINATION {
            return Err(Error::placement(tag, pos, global_box.make_fraction(pos)));
        }
        if target == owner {
            return Ok(());
        }

        self.remove_all_ghost_particles();
        let me = self.comm.rank();
        if me == owner {
            if let Some(idx) = slot {
                self.arrays.comm_flags_mut()[idx] = target;
            }
            let records: Vec<PackedParticle> = self
                .remove_particles()
                .into_iter()
                .map(|(_, record)| record)
                .collect();
            self.comm.send_pod(target, RELOCATE, &records)?;
            if records.len() != 1 {
                return Err(Error::UnexpectedRecordCount {
                    expected: 1,
                    found: records.len(),
                });
            }
        } else if me == target {
            let records = self.comm.recv_pod::<PackedParticle>(owner, RELOCATE)?;
            if records.len() != 1 {
                return Err(Error::UnexpectedRecordCount {
                    expected: 1,
                    found: records.len(),
                });
            }
            self.add_particles(&records)?;
        }

        trace!("particle {tag} moved from rank {owner} to rank {target}");
        self.signals.particle_moved.emit(&ParticleMove {
            tag,
            from: owner,
            to: target,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalCluster, SerialCommunicator};
    use crate::model::boxdim::BoxDim;
    use crate::model::snapshot::SnapshotParticleData;
    use crate::model::types::NOT_LOCAL;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn two_slabs() -> Option<DomainDecomposition> {
        Some(DomainDecomposition::new([2, 1, 1]).unwrap())
    }

    /// Four particles, two on each side of `x = 0`.
    fn slab_snapshot() -> SnapshotParticleData {
        let mut snapshot = SnapshotParticleData::new(4);
        snapshot.type_mapping = vec!["A".to_string()];
        snapshot.pos = vec![
            [-4.0, 0.0, 0.0],
            [-1.0, 1.0, 0.0],
            [1.0, -1.0, 0.0],
            [4.0, 0.0, 2.0],
        ];
        for i in 0..4 {
            snapshot.charge[i] = i as f64;
            snapshot.vel[i] = [i as f64, 0.0, 0.0];
        }
        snapshot
    }

    /// Local tags, after checking each one's reverse lookup.
    fn local_tags<C: Communicator>(pdata: &ParticleData<C>) -> Vec<Tag> {
        let tags = pdata.arrays().tag[..pdata.n_local()].to_vec();
        for (slot, &tag) in tags.iter().enumerate() {
            assert_eq!(pdata.rtags()[tag as usize], slot as u32);
        }
        tags
    }

    #[test]
    fn remove_particles_compacts_survivors_in_order() {
        let mut pdata =
            ParticleData::new(5, BoxDim::cube(10.0), 1, SerialCommunicator::new(), None).unwrap();
        for tag in 0..5 {
            pdata.set_charge(tag, tag as f64 * 10.0).unwrap();
        }
        pdata.comm_flags_mut()[1] = 3;
        pdata.comm_flags_mut()[3] = 2;

        let leaving = pdata.remove_particles();
        assert_eq!(leaving.len(), 2);
        assert_eq!((leaving[0].0, leaving[0].1.tag), (3, 1));
        assert_eq!((leaving[1].0, leaving[1].1.tag), (2, 3));
        assert_eq!(leaving[1].1.charge, 30.0);

        assert_eq!(pdata.n_local(), 3);
        assert_eq!(&pdata.arrays().tag[..3], &[0, 2, 4]);
        assert_eq!(pdata.rtags()[1], NOT_LOCAL);
        assert_eq!(pdata.rtags()[4], 2);
        assert_eq!(pdata.charge(4).unwrap(), 40.0);
        assert!(pdata.comm_flags_mut().iter().all(|&f| f == NO_DESTINATION));

        pdata.add_particles(&[leaving[0].1]).unwrap();
        assert_eq!(pdata.n_local(), 4);
        assert_eq!(pdata.rtags()[1], 3);
        assert_eq!(pdata.charge(1).unwrap(), 10.0);
    }

    #[test]
    fn remove_particles_without_flags_is_a_no_op() {
        let mut pdata =
            ParticleData::new(3, BoxDim::cube(10.0), 1, SerialCommunicator::new(), None).unwrap();
        pdata.add_ghost_particles(2);
        assert!(pdata.remove_particles().is_empty());
        assert_eq!(pdata.n_local(), 3);
        assert_eq!(pdata.n_ghosts(), 0);
    }

    #[test]
    fn migrate_without_decomposition_does_nothing() {
        let mut pdata =
            ParticleData::new(2, BoxDim::cube(10.0), 1, SerialCommunicator::new(), None).unwrap();
        assert_eq!(pdata.migrate().unwrap(), MigrationSummary::default());
    }

    #[test]
    fn particles_start_on_their_home_rank() {
        let snapshot = slab_snapshot();
        let locals = LocalCluster::run(2, |comm| {
            let pdata =
                ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), comm, two_slabs())
                    .unwrap();
            let mut tags = pdata.arrays().tag[..pdata.n_local()].to_vec();
            tags.sort_unstable();
            tags
        });
        assert_eq!(locals, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn migration_moves_particle_across_slab_boundary() {
        let snapshot = slab_snapshot();
        let results = LocalCluster::run(2, |comm| {
            let mut pdata =
                ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), comm, two_slabs())
                    .unwrap();
            let moves = Rc::new(RefCell::new(Vec::new()));
            {
                let moves = Rc::clone(&moves);
                pdata
                    .signals_mut()
                    .particle_moved
                    .connect(move |m| moves.borrow_mut().push(*m));
            }

            // Tag 1 drifts from x = -1 to x = 0.5 on rank 0.
            if let Some(slot) = pdata.rtags().get(1).copied().filter(|&s| s != NOT_LOCAL) {
                pdata.arrays_mut().pos[slot as usize].position = [0.5, 1.0, 0.0];
            }
            let summary = pdata.migrate().unwrap();

            let rank = pdata.rank();
            let local_one = pdata.is_local(1);
            let position = pdata.position(1).unwrap();
            let charge = pdata.charge(1).unwrap();
            let velocity = pdata.velocity(1).unwrap();
            let owner = pdata.owner_rank(1).unwrap();
            let moves = moves.borrow().clone();
            let tags = local_tags(&pdata);
            (rank, summary, local_one, position, charge, velocity, owner, moves, pdata.rtags()[1], tags)
        });

        let (_, summary0, local0, ..) = &results[0];
        let (_, summary1, local1, position, charge, velocity, owner, moves, ..) = &results[1];
        assert_eq!(*summary0, MigrationSummary { sent: 1, received: 0 });
        assert_eq!(*summary1, MigrationSummary { sent: 0, received: 1 });
        assert!(!local0);
        assert!(local1);
        assert_eq!(results[0].8, NOT_LOCAL);
        assert_eq!(*position, [0.5, 1.0, 0.0]);
        assert_eq!(*charge, 1.0);
        assert_eq!(*velocity, [1.0, 0.0, 0.0]);
        assert_eq!(*owner, 1);
        let expected = ParticleMove {
            tag: 1,
            from: 0,
            to: 1,
        };
        assert_eq!(*moves, vec![expected]);
        assert_eq!(results[0].7, vec![expected]);

        let mut everywhere: Vec<Tag> = results.iter().flat_map(|r| r.9.clone()).collect();
        everywhere.sort_unstable();
        assert_eq!(everywhere, vec![0, 1, 2, 3]);
        assert_eq!(results[0].9.len(), 1);
        assert_eq!(results[1].9.len(), 3);
    }

    #[test]
    fn records_with_unissued_tags_are_refused() {
        let mut pdata =
            ParticleData::new(2, BoxDim::cube(10.0), 1, SerialCommunicator::new(), None).unwrap();
        pdata.add_ghost_particles(1);
        let result = pdata.add_particles(&[PackedParticle::new(1), PackedParticle::new(50)]);
        assert!(matches!(
            result,
            Err(Error::UnknownTag {
                tag: 50,
                maximum: Some(1)
            })
        ));
        assert_eq!(pdata.n_local(), 2);
        assert_eq!(pdata.n_ghosts(), 1);
        assert_eq!(&pdata.arrays().tag[..2], &[0, 1]);
    }

    #[test]
    fn relocation_with_stale_departure_fails_on_both_ends() {
        let snapshot = slab_snapshot();
        let results = LocalCluster::run(2, |comm| {
            let mut pdata =
                ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), comm, two_slabs())
                    .unwrap();
            if pdata.rank() == 0 {
                let slot = pdata.rtags()[1] as usize;
                pdata.comm_flags_mut()[slot] = 1;
            }
            pdata.set_position(0, [3.0, 0.0, 0.0], true)
        });
        for result in results {
            assert!(matches!(
                result,
                Err(Error::UnexpectedRecordCount {
                    expected: 1,
                    found: 2
                })
            ));
        }
    }

    #[test]
    fn migration_wraps_through_periodic_boundary() {
        let snapshot = slab_snapshot();
        let results = LocalCluster::run(2, |comm| {
            let mut pdata =
                ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), comm, two_slabs())
                    .unwrap();
            // Tag 0 leaves through x = -5 and reappears near x = +4.5.
            if let Some(slot) = pdata.rtags().get(0).copied().filter(|&s| s != NOT_LOCAL) {
                pdata.arrays_mut().pos[slot as usize].position = [-5.5, 0.0, 0.0];
            }
            pdata.migrate().unwrap();
            (pdata.n_local(), pdata.image(0).unwrap(), pdata.position(0).unwrap())
        });
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 3);
        assert_eq!(results[1].1, [-1, 0, 0]);
        assert!((results[1].2[0] - 4.5).abs() < 1e-12);
    }

    #[test]
    fn non_finite_position_fails_migration_everywhere() {
        let snapshot = slab_snapshot();
        let results = LocalCluster::run(2, |comm| {
            let mut pdata =
                ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), comm, two_slabs())
                    .unwrap();
            if pdata.rank() == 1 {
                let slot = pdata.rtags()[3] as usize;
                pdata.arrays_mut().pos[slot].position = [f64::NAN, 0.0, 0.0];
            }
            let result = pdata.migrate();
            (pdata.n_local(), result)
        });
        assert!(matches!(results[0].1, Err(Error::PeerFailure { .. })));
        assert!(matches!(results[1].1, Err(Error::Placement { tag: 3, .. })));
        assert_eq!(results[0].0, 2);
        assert_eq!(results[1].0, 2);
    }

    #[test]
    fn set_position_hands_particle_to_new_owner() {
        let snapshot = slab_snapshot();
        let results = LocalCluster::run(2, |comm| {
            let mut pdata =
                ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), comm, two_slabs())
                    .unwrap();
            pdata.set_position(2, [-2.0, 0.0, 0.0], true).unwrap();
            pdata.set_position(0, [-3.0, 0.0, 0.0], true).unwrap();
            (
                pdata.rank(),
                pdata.n_local(),
                pdata.owner_rank(2).unwrap(),
                pdata.position(2).unwrap(),
                pdata.charge(2).unwrap(),
                pdata.position(0).unwrap(),
            )
        });
        for (rank, n_local, owner, position, charge, unmoved) in results {
            assert_eq!(n_local, if rank == 0 { 3 } else { 1 });
            assert_eq!(owner, 0);
            assert_eq!(position, [-2.0, 0.0, 0.0]);
            assert_eq!(charge, 2.0);
            assert_eq!(unmoved, [-3.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn set_position_without_move_leaves_owner_alone() {
        let snapshot = slab_snapshot();
        let results = LocalCluster::run(2, |comm| {
            let mut pdata =
                ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), comm, two_slabs())
                    .unwrap();
            pdata.set_position(2, [-2.0, 0.0, 0.0], false).unwrap();
            let owner_before = pdata.owner_rank(2).unwrap();
            pdata.migrate().unwrap();
            (owner_before, pdata.owner_rank(2).unwrap())
        });
        assert!(results.iter().all(|&r| r == (1, 0)));
    }
}
