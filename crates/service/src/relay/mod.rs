pub mod audit;
pub mod cooldown;
pub mod credentials;
pub mod health;
pub mod orchestrator;
pub mod pricing;
pub mod reconciler;
pub mod retry;
pub mod selection;
