use super::error::Error;
use super::{ParticleData, ROOT};
use crate::comm::{Communicator, CommunicatorExt};
use crate::model::packed::PackedParticle;
use crate::model::snapshot::SnapshotParticleData;
use crate::model::types::{NO_BODY, PositionType, Tag, VelocityMass};
use log::{info, warn};
use std::collections::BTreeMap;

/// Fractional slack allowed when checking snapshot positions against the box.
const BOX_TOLERANCE: f64 = 1e-5;

/// A snapshot assembled on rank 0, with the snapshot index of each tag.
#[derive(Debug, Clone, PartialEq)]
pub struct TakenSnapshot {
    pub snapshot: SnapshotParticleData,
    /// Maps each active tag to its record index in `snapshot`.
    pub index: BTreeMap<Tag, usize>,
}

impl<C: Communicator> ParticleData<C> {
    /// Replaces every particle with the contents of `snapshot`.
    ///
    /// Only rank 0's snapshot is read. Particles receive tags `0..n` in
    /// snapshot order and are sent to the rank owning their position. With
    /// `ignore_bodies`, records that belong to a rigid body are skipped.
    /// Collective.
    pub fn initialize_from_snapshot(
        &mut self,
        snapshot: &SnapshotParticleData,
        ignore_bodies: bool,
    ) -> Result<(), Error> {
        self.remove_all_ghost_particles();

        let staged = if self.comm.rank() == ROOT {
            self.stage_snapshot(snapshot, ignore_bodies)
        } else {
            Ok(Vec::new())
        };
        let per_rank = self.agree(staged, "snapshot initialization")?;

        let type_mapping = self.comm.broadcast_value(ROOT, &snapshot.type_mapping)?;
        let staged_total = per_rank.iter().map(Vec::len).sum::<usize>() as u64;
        let n_global = self.comm.broadcast_pod(ROOT, staged_total)? as usize;
        let parts = (self.comm.rank() == ROOT).then_some(per_rank);
        let local = self.comm.scatter_pod::<PackedParticle>(ROOT, parts)?;

        self.type_mapping = type_mapping;
        self.tags.reset(n_global);
        self.arrays.allocate(local.len().max(1))?;
        self.signals.capacity_changed.emit(&self.arrays.capacity());
        self.arrays.resize(local.len());

        let arrays = self.arrays.front_mut();
        for (idx, record) in local.iter().enumerate() {
            arrays.unpack(idx, record);
        }
        self.tags.assign_slots(&self.arrays.front().tag[..local.len()], 0);
        self.n_global = n_global;

        info!(
            "rank {}: loaded {} of {} particles, {} types",
            self.comm.rank(),
            local.len(),
            n_global,
            self.type_mapping.len()
        );
        self.signals.global_count_changed.emit(&self.n_global);
        self.signals.particle_sort.emit(&());
        self.signals.num_types_changed.emit(&self.type_mapping.len());
        Ok(())
    }

    /// Validates the snapshot and packs its records per destination rank.
    fn stage_snapshot(
        &self,
        snapshot: &SnapshotParticleData,
        ignore_bodies: bool,
    ) -> Result<Vec<Vec<PackedParticle>>, Error> {
        snapshot.validate()?;
        let n_types = snapshot.type_mapping.len();
        let mut per_rank = vec![Vec::new(); self.comm.size() as usize];
        let mut next_tag: Tag = 0;

        for i in 0..snapshot.size {
            if ignore_bodies && snapshot.body[i] != NO_BODY {
                continue;
            }
            let type_id = snapshot.type_id[i];
            if type_id as usize >= n_types {
                return Err(Error::UnknownType { type_id, n_types });
            }
            let mut pos = snapshot.pos[i];
            let mut image = snapshot.image[i];
            if !self.global_box.contains(pos, BOX_TOLERANCE) {
                warn!("snapshot particle {i} at {pos:?} lies outside the global box");
                return Err(Error::OutsideBox {
                    index: i,
                    position: pos,
                });
            }
            let rank = match &self.decomposition {
                Some(d) => d
                    .place_and_wrap(&self.global_box, &mut pos, &mut image)
                    .ok_or_else(|| {
                        Error::placement(next_tag, pos, self.global_box.make_fraction(pos))
                    })?,
                None => ROOT,
            };

            let mut record = PackedParticle::new(next_tag);
            record.pos = PositionType::new(pos, type_id);
            record.vel = VelocityMass::new(snapshot.vel[i], snapshot.mass[i]);
            record.accel = snapshot.accel[i];
            record.charge = snapshot.charge[i];
            record.diameter = snapshot.diameter[i];
            record.image = image;
            record.body = snapshot.body[i];
            record.orientation = snapshot.orientation[i];
            record.angmom = snapshot.angmom[i];
            record.inertia = snapshot.inertia[i];
            per_rank[rank as usize].push(record);
            next_tag += 1;
        }
        Ok(per_rank)
    }

    /// Gathers every particle onto rank 0 as a snapshot in ascending tag
    /// order.
    ///
    /// Returns `Ok(None)` on all other ranks. Collective.
    pub fn take_snapshot(&mut self) -> Result<Option<TakenSnapshot>, Error> {
        let n_local = self.arrays.n_local();
        let live = self.arrays.front();
        let local: Vec<PackedParticle> = (0..n_local).map(|idx| live.pack(idx)).collect();
        let Some(per_rank) = self.comm.gather_pod(ROOT, &local)? else {
            return Ok(None);
        };

        let mut owners = BTreeMap::new();
        for (rank, records) in per_rank.iter().enumerate() {
            for (idx, record) in records.iter().enumerate() {
                if owners.insert(record.tag, (rank, idx)).is_some() {
                    return Err(Error::MultipleOwners {
                        tag: record.tag,
                        count: 2,
                    });
                }
            }
        }
        let mut snapshot = SnapshotParticleData::new(self.n_global);
        snapshot.type_mapping = self.type_mapping.clone();
        let mut index = BTreeMap::new();
        for (i, &tag) in self.tags.active_tags().iter().enumerate() {
            let &(rank, idx) = owners
                .get(&tag)
                .ok_or(Error::MissingFromSnapshot { tag })?;
            let record = &per_rank[rank][idx];
            let mut pos = record.pos.position;
            let mut image = record.image;
            self.global_box.wrap(&mut pos, &mut image);

            snapshot.pos[i] = pos;
            snapshot.vel[i] = record.vel.velocity;
            snapshot.accel[i] = record.accel;
            snapshot.type_id[i] = record.pos.type_id;
            snapshot.mass[i] = record.vel.mass;
            snapshot.charge[i] = record.charge;
            snapshot.diameter[i] = record.diameter;
            snapshot.image[i] = image;
            snapshot.body[i] = record.body;
            snapshot.orientation[i] = record.orientation;
            snapshot.angmom[i] = record.angmom;
            snapshot.inertia[i] = record.inertia;
            index.insert(tag, i);
        }
        // records for tags no longer active
        if owners.len() != index.len() {
            return Err(Error::UnexpectedRecordCount {
                expected: index.len(),
                found: owners.len(),
            });
        }
        Ok(Some(TakenSnapshot { snapshot, index }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalCluster, SerialCommunicator};
    use crate::model::boxdim::BoxDim;
    use crate::pdata::decomposition::DomainDecomposition;

    fn sample(n: usize) -> SnapshotParticleData {
        let mut snapshot = SnapshotParticleData::new(n);
        snapshot.type_mapping = vec!["A".to_string(), "B".to_string()];
        for i in 0..n {
            let x = -4.5 + 9.0 * i as f64 / n as f64;
            snapshot.pos[i] = [x, 0.25 * i as f64 - 1.0, 0.0];
            snapshot.vel[i] = [0.0, i as f64, 0.0];
            snapshot.type_id[i] = (i % 2) as u32;
            snapshot.mass[i] = 1.0 + i as f64;
            snapshot.charge[i] = -(i as f64);
            snapshot.image[i] = [i as i32, 0, 0];
        }
        snapshot
    }

    #[test]
    fn serial_round_trip_preserves_every_field() {
        let original = sample(5);
        let mut pdata =
            ParticleData::from_snapshot(&original, BoxDim::cube(10.0), SerialCommunicator::new(), None)
                .unwrap();
        assert_eq!(pdata.n_types(), 2);
        assert_eq!(pdata.mass(3).unwrap(), 4.0);

        let taken = pdata.take_snapshot().unwrap().unwrap();
        assert_eq!(taken.snapshot, original);
        assert_eq!(
            taken.index,
            (0..5).map(|t| (t, t as usize)).collect::<BTreeMap<_, _>>()
        );
    }

    #[test]
    fn snapshot_follows_tag_order_after_removal() {
        let mut pdata =
            ParticleData::from_snapshot(&sample(4), BoxDim::cube(10.0), SerialCommunicator::new(), None)
                .unwrap();
        pdata.remove_particle(0).unwrap();
        let taken = pdata.take_snapshot().unwrap().unwrap();
        assert_eq!(taken.snapshot.size, 3);
        assert_eq!(taken.index.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(taken.snapshot.charge, vec![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn snapshot_outside_box_is_rejected() {
        let mut snapshot = sample(2);
        snapshot.pos[1] = [6.0, 0.0, 0.0];
        let result =
            ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), SerialCommunicator::new(), None);
        assert!(matches!(result, Err(Error::OutsideBox { index: 1, .. })));
    }

    #[test]
    fn malformed_snapshot_is_rejected() {
        let mut snapshot = sample(3);
        snapshot.charge.pop();
        let result =
            ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), SerialCommunicator::new(), None);
        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));

        let mut snapshot = sample(3);
        snapshot.type_id[2] = 5;
        let result =
            ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), SerialCommunicator::new(), None);
        assert!(matches!(result, Err(Error::UnknownType { type_id: 5, .. })));
    }

    #[test]
    fn ignore_bodies_skips_rigid_body_members() {
        let mut snapshot = sample(4);
        snapshot.body[1] = 0;
        snapshot.body[2] = 0;
        let mut pdata =
            ParticleData::new(1, BoxDim::cube(10.0), 1, SerialCommunicator::new(), None).unwrap();
        pdata.initialize_from_snapshot(&snapshot, true).unwrap();
        assert_eq!(pdata.n_global(), 2);
        assert_eq!(pdata.charge(1).unwrap(), -3.0);
        assert_eq!(pdata.type_mapping(), &["A", "B"]);
    }

    #[test]
    fn empty_snapshot_still_allocates() {
        let mut snapshot = SnapshotParticleData::new(0);
        snapshot.type_mapping = vec!["A".to_string()];
        let mut pdata =
            ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), SerialCommunicator::new(), None)
                .unwrap();
        assert_eq!(pdata.n_global(), 0);
        assert!(pdata.capacity() >= 1);
        assert_eq!(pdata.take_snapshot().unwrap().unwrap().snapshot.size, 0);
        assert_eq!(pdata.add_particle(0).unwrap(), 0);
    }

    #[test]
    fn distributed_snapshot_is_gathered_in_tag_order() {
        let original = sample(6);
        let decomposition = Some(DomainDecomposition::new([2, 1, 1]).unwrap());
        let results = LocalCluster::run(2, |comm| {
            let mut pdata =
                ParticleData::from_snapshot(&original, BoxDim::cube(10.0), comm, decomposition)
                    .unwrap();
            assert_eq!(pdata.n_global(), 6);
            (pdata.n_local(), pdata.take_snapshot().unwrap())
        });

        assert_eq!(results[0].0 + results[1].0, 6);
        assert_eq!(results[0].0, 3);
        assert!(results[1].1.is_none());
        let taken = results[0].1.as_ref().unwrap();
        assert_eq!(taken.snapshot, original);
        assert_eq!(taken.index.len(), 6);
        assert!(taken.index.iter().all(|(&tag, &i)| tag as usize == i));
    }

    #[test]
    fn distributed_snapshot_after_migration_and_removal() {
        let original = sample(6);
        let decomposition = Some(DomainDecomposition::new([2, 1, 1]).unwrap());
        let results = LocalCluster::run(2, |comm| {
            let mut pdata =
                ParticleData::from_snapshot(&original, BoxDim::cube(10.0), comm, decomposition)
                    .unwrap();
            pdata.set_position(0, [4.0, 0.0, 0.0], true).unwrap();
            pdata.remove_particle(4).unwrap();
            pdata.take_snapshot().unwrap()
        });
        let taken = results[0].as_ref().unwrap();
        assert_eq!(taken.snapshot.size, 5);
        assert_eq!(
            taken.index.keys().copied().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 5]
        );
        assert_eq!(taken.snapshot.pos[0], [4.0, 0.0, 0.0]);
        assert_eq!(taken.snapshot.charge[4], -5.0);
    }

    #[test]
    fn active_particle_missing_from_every_rank_is_reported() {
        let mut pdata =
            ParticleData::new(3, BoxDim::cube(10.0), 1, SerialCommunicator::new(), None).unwrap();
        pdata.comm_flags_mut()[1] = 0;
        assert_eq!(pdata.remove_particles().len(), 1);
        assert!(matches!(
            pdata.take_snapshot(),
            Err(Error::MissingFromSnapshot { tag: 1 })
        ));
    }

    #[test]
    fn record_for_retired_tag_is_rejected() {
        let mut pdata =
            ParticleData::new(3, BoxDim::cube(10.0), 1, SerialCommunicator::new(), None).unwrap();
        let stale = pdata.arrays().pack(2);
        pdata.remove_particle(2).unwrap();
        pdata.add_particles(&[stale]).unwrap();
        assert!(matches!(
            pdata.take_snapshot(),
            Err(Error::UnexpectedRecordCount {
                expected: 2,
                found: 3
            })
        ));
    }

    #[test]
    fn particle_dropped_on_one_rank_is_missing_from_snapshot() {
        let decomposition = Some(DomainDecomposition::new([2, 1, 1]).unwrap());
        let results = LocalCluster::run(2, |comm| {
            let mut pdata =
                ParticleData::from_snapshot(&sample(4), BoxDim::cube(10.0), comm, decomposition)
                    .unwrap();
            if pdata.rank() == 1 {
                let slot = pdata.rtags()[3] as usize;
                pdata.comm_flags_mut()[slot] = 1;
                assert_eq!(pdata.remove_particles().len(), 1);
            }
            pdata.take_snapshot().map(|taken| taken.is_some())
        });
        assert!(matches!(results[0], Err(Error::MissingFromSnapshot { tag: 3 })));
        assert!(matches!(results[1], Ok(false)));
    }

    #[test]
    fn bad_snapshot_fails_on_every_rank() {
        let mut snapshot = sample(4);
        snapshot.pos[0] = [50.0, 0.0, 0.0];
        let decomposition = Some(DomainDecomposition::new([2, 1, 1]).unwrap());
        let results = LocalCluster::run(2, |comm| {
            ParticleData::from_snapshot(&snapshot, BoxDim::cube(10.0), comm, decomposition).err()
        });
        assert!(matches!(results[0], Some(Error::OutsideBox { index: 0, .. })));
        assert!(matches!(results[1], Some(Error::PeerFailure { .. })));
    }
}
