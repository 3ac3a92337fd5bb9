pub mod diagnostic_handlers;
