pub mod affinity;
pub mod topology;
