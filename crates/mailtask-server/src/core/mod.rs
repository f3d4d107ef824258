mod forward;
mod handler;
mod health;
mod imap;
mod item;
mod ledger;
mod metrics;
mod orchestrator;
mod parser;
mod queue;
mod server;
mod spool;
#[cfg(test)]
mod testing;
mod transport;

pub use forward::ForwardHandler;
pub use handler::HandlerRegistry;
pub use imap::ImapTransport;
pub use orchestrator::{
    ExhaustedTask, IngestSettings, MailboxRoute, Orchestrator, Pipeline,
};
pub use parser::{MimeParser, RouteTable};
pub use queue::{QueueLimits, RetryPolicy, RetryQueue};
pub use server::{bind_health_listener, run_health_server};
pub use spool::{SpoolDir, SpoolHandler, run_dead_letter_writer};
