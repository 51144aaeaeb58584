pub mod redb_impl;
