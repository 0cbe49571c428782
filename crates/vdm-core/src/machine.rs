use serde::{Deserialize, Serialize};

/// Default administrator account name on desktop images.
pub const DEFAULT_ADMIN_USERNAME: &str = "Administrator";

/// A provisionable hardware/image class offered by a backend.
///
/// `image` and `flavor` are backend-interpreted: the public-cloud adapter
/// reads them as machine image id + instance class, the private-cloud
/// adapter as base image reference + flavor reference. The broker treats
/// the whole record as an opaque token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineType {
    pub id: String,
    pub image: String,
    pub flavor: String,
}

/// Administrator credentials for one machine.
///
/// Lazily resolved; backends may be unable to produce them until the guest
/// has finished booting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Requested attributes for a machine about to be created.
///
/// A `None` machine type asks the backend for its default class. An empty
/// password asks the backend to pick one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineAttributes {
    pub machine_type: Option<MachineType>,
    pub name: String,
    pub username: String,
    pub password: String,
}
