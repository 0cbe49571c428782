// vdm-broker: allocation policy over the assignment record and one driver.
// The broker is stateless between calls; the persistent assignment record is
// the single source of truth for ownership and the only shared mutable state.

mod broker;

pub use broker::{Broker, BrokerError};
