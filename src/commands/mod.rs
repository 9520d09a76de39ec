mod check_rules;
mod poll;
mod status;

pub use check_rules::CheckRulesCommand;
pub use poll::PollCommand;
pub use status::StatusCommand;
