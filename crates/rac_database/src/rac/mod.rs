//! The RAC engine: everything a reconcile pass does, behind [`crate::client::ClusterClient`].

pub mod asm;
pub mod builders;
pub mod cleanup;
pub mod config;
pub mod discovery;
pub mod disks;
pub mod lifecycle;
pub mod nodes;
pub mod reconcile;
pub mod rollout;
pub mod service;
pub mod volumes;

#[cfg(test)]
pub(crate) mod testing;
