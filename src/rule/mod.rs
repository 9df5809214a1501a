//! Rule engine module

mod engine;
mod rules;
pub mod script;
mod trie;

pub use engine::{RuleEngine, RuleMatch};
pub use rules::{PortRange, Rule};
pub use script::{CompiledExpr, ProviderMatch, Script, ScriptEnv};
pub use trie::DomainTrie;
