//! Synchronous operations behind the HTTP surface. Each service validates,
//! writes the record, and talks to the backends the record depends on.

mod dns;
mod instances;
mod network;
mod volumes;

pub use dns::{DnsService, RecordRequest};
pub use instances::{
    backend_name, backend_zone, instance_type_envelope, record_fqdn, InstanceRequest,
    InstanceService, Timeouts, AUTO_RECORD_TTL,
};
pub use network::{bridge_name, NetworkService};
pub use volumes::{VolumeService, MAX_VOLUME_GB};
