pub use egress_gateway_controller::metrics::REGISTRY;
