//! # vdm — Virtual desktop machine fleet broker
//!
//! Facade crate that re-exports the vdm workspace crates so consumers can
//! depend on a single `vdmctl` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | vdm-core | Status model, machine records, errors, config |
//! | [`store`] | vdm-store | Assignment record, secrets, static registry |
//! | [`provision`] | vdm-provision | Bootstrap tasks with multicast output |
//! | [`vms`] | vdm-vms | Driver capability layer and backend adapters |
//! | [`broker`] | vdm-broker | Pool allocation and boot-wait logic |
//! | [`cli`] | vdm-cli | Clap commands and bootstrap |

pub use vdm_broker as broker;
pub use vdm_cli as cli;
pub use vdm_core as core;
pub use vdm_provision as provision;
pub use vdm_store as store;
pub use vdm_vms as vms;
