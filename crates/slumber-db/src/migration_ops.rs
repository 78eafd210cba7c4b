use redb_bincode::ReadableTable as _;
use tracing::{debug, info};

use crate::{
    Database, DbResult, DbVersionTooHighSnafu, LOG_TARGET, WriteTransactionCtx, db_version,
    follower_counts, follows, follows_by_pair, follows_followers, follows_following,
    id_sequences, records, records_by_author, users,
};

impl Database {
    pub(crate) fn init_tables_tx(tx: &WriteTransactionCtx) -> DbResult<()> {
        tx.open_table(&db_version::TABLE)?;
        tx.open_table(&id_sequences::TABLE)?;

        tx.open_table(&users::TABLE)?;

        tx.open_table(&follows::TABLE)?;
        tx.open_table(&follows_by_pair::TABLE)?;
        tx.open_table(&follows_followers::TABLE)?;
        tx.open_table(&follows_following::TABLE)?;
        tx.open_table(&follower_counts::TABLE)?;

        tx.open_table(&records::TABLE)?;
        tx.open_table(&records_by_author::TABLE)?;
        Ok(())
    }

    pub(crate) fn handle_db_ver_migrations(dbtx: &WriteTransactionCtx) -> DbResult<()> {
        const DB_VER: u64 = 0;

        let mut table_db_ver = dbtx.open_table(&db_version::TABLE)?;

        let Some(cur_db_ver) = table_db_ver.first()?.map(|g| g.1.value()) else {
            info!(target: LOG_TARGET, "Initializing new database");
            table_db_ver.insert(&(), &DB_VER)?;

            return Ok(());
        };

        if DB_VER < cur_db_ver {
            return DbVersionTooHighSnafu {
                db_ver: cur_db_ver,
                code_ver: DB_VER,
            }
            .fail();
        }

        debug!(target: LOG_TARGET, db_ver = cur_db_ver, "Db version");

        Ok(())
    }
}
