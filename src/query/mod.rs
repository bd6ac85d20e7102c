// Query Compiler - one compiler, several backend emitters
//
// FilterExpression --(QueryCompiler)--> Predicate --(QueryEmitter)--> store query

pub mod compiler;
pub mod filter;
pub mod odata;
pub mod sqlite;

pub use compiler::{Comparison, Predicate, QueryCompiler};
pub use filter::{CombinationOperator, Filter, FilterExpression, FilterGroup, Operator};
pub use odata::{ODataEmitter, ODataRequest};
pub use sqlite::{SqlQuery, SqliteEmitter};

/// Renders a compiled predicate for one backend. Both shapes answer a single
/// search call: a page of results in stable id order, and the total count.
pub trait QueryEmitter {
    type Query;

    fn paged(&self, predicate: &Predicate, skip: usize, take: usize) -> Self::Query;

    fn count(&self, predicate: &Predicate) -> Self::Query;
}
