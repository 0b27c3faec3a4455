pub use sea_orm_migration::prelude::*;

mod m20250512_090000_add_core_tables;
mod m20250520_101500_add_signing_keys;
mod m20250601_140000_add_token_policy;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250512_090000_add_core_tables::Migration),
            Box::new(m20250520_101500_add_signing_keys::Migration),
            Box::new(m20250601_140000_add_token_policy::Migration),
        ]
    }
}
