//! Adapter construction from a datasource descriptor.

use tally_core::{Datasource, DatasourceKind, Engine, FileFormat, Result};
use tracing::info;

use crate::config::EngineConfig;
use crate::file::FileAdapter;
use crate::mongo::MongoAdapter;
use crate::sql::SqlAdapter;
use crate::DataSourceAdapter;

/// Pick the adapter for `datasource`. Nothing is opened here; unsupported
/// engines and file extensions fail as configuration errors.
pub fn build_adapter(
    datasource: &Datasource,
    config: &EngineConfig,
) -> Result<Box<dyn DataSourceAdapter>> {
    match &datasource.kind {
        DatasourceKind::Database(params) => match params.engine {
            Engine::Mongo => {
                info!(
                    "Building MongoAdapter for database '{}' at {}",
                    params.database, params.host
                );
                Ok(Box::new(MongoAdapter::new(params.clone())))
            }
            Engine::Mysql | Engine::Mssql | Engine::Postgres => {
                info!(
                    "Building SqlAdapter ({}) for database '{}' at {}",
                    params.engine, params.database, params.host
                );
                Ok(Box::new(SqlAdapter::new(params.clone(), config)?))
            }
        },
        DatasourceKind::File(location) => {
            let format = location.format()?;
            info!(
                "Building FileAdapter ({}) for {}",
                format.as_str(),
                location.file_path.display()
            );
            if format == FileFormat::Spreadsheet {
                info!("Sheets of {} are exposed as tables", location.file_path.display());
            }
            Ok(Box::new(FileAdapter::new(location.clone(), config)?))
        }
    }
}
