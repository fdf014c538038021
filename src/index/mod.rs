pub mod record_list;
pub mod segment_table;
pub mod table_cache;
pub mod value_store;
