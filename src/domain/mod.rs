// Domain layer: core models and ports (interfaces).

pub mod batch;
pub mod model;
pub mod ports;
