//! Plain data types shared by the particle store and its transports.
//!
//! - [`types`] – Scalar aliases, sentinels and the paired per-particle records.
//! - [`boxdim`] – The simulation box with periodic wrapping.
//! - [`packed`] – The fixed-size record a particle travels in between ranks.
//! - [`snapshot`] – Global, tag-ordered copies of every particle.
//!
//! Nothing here knows about ranks or communication; the distributed store in
//! `pdata` is built on top of these types.

pub mod boxdim;
pub mod packed;
pub mod snapshot;
pub mod types;
