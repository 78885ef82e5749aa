// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A declarative infrastructure reconciliation engine.
//!
//! ## Overview
//!
//! Converge reads a set of resource definitions, works out the order in
//! which they depend on each other, compares them with what was last
//! applied, and drives a provider until reality matches the definitions:
//!
//! - Define resources and their references in a YAML project file
//! - Preview the exact create, update, replace and destroy actions
//! - Apply independent branches concurrently, retrying transient failures
//! - Persist state after every action so partial runs resume cleanly
//!
//! ## Architecture
//!
//! 1. **Graph**: definitions become a validated dependency graph
//! 2. **Resolver**: a deterministic topological order with parallel levels
//! 3. **Diff**: desired attributes against recorded state
//! 4. **Plan**: ordered actions, replacement split into destroy and create
//! 5. **Executor**: bounded concurrent execution with per-action state writes
//!
//! ## Modules
//!
//! - [`config`]: Project file parsing and validation
//! - [`graph`]: Addresses, attribute values and dependency ordering
//! - [`planner`]: Diff computation, plans and the apply executor
//! - [`provider`]: The provider seam and a simulated provider
//! - [`state`]: State storage backends (local file, memory)
//! - [`reconciler`]: End-to-end plan and apply runs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! resources:
//!   - type: network
//!     name: main
//!     attributes:
//!       address_space: 10.0.0.0/16
//!   - type: subnet
//!     name: app
//!     attributes:
//!       vnet: { $ref: network.main.id }
//!       prefix: 10.0.1.0/24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{AttributeHasher, ConfigParser, ConfigValidator, ProjectConfig};
pub use error::{ConvergeError, Result};
pub use graph::{Address, AttributeValue, DependencyResolver, ResourceGraph};
pub use planner::{DiffEngine, Plan, PlanExecutor};
pub use provider::{Provider, ProviderContext, SimulatedProvider};
pub use reconciler::{Reconciler, RunReport};
pub use state::{LocalStateStore, MemoryStateStore, StateStore};
