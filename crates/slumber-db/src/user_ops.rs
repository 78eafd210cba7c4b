use redb_bincode::ReadableTable as _;
use slumber_core::{Timestamp, UserId};
use snafu::ensure;
use tracing::debug;

use crate::{
    Database, DbResult, IdSequence, LOG_TARGET, UserNotFoundSnafu, UserRecord, id_sequences, users,
};

impl Database {
    pub(crate) fn ensure_user_tx(
        user_id: UserId,
        users_table: &impl users::ReadableTable,
    ) -> DbResult<()> {
        ensure!(
            users_table.get(&user_id)?.is_some(),
            UserNotFoundSnafu { user_id }
        );
        Ok(())
    }

    /// Register a new user identity
    ///
    /// Users carry no domain events; nothing downstream reacts to them.
    pub async fn create_user(&self) -> DbResult<UserId> {
        let user_id = self
            .write_with(|tx| {
                let user_id = UserId::new(Self::next_id_tx(
                    IdSequence::Users,
                    &mut tx.open_table(&id_sequences::TABLE)?,
                )?);
                tx.open_table(&users::TABLE)?.insert(
                    &user_id,
                    &UserRecord {
                        created_at: Timestamp::now(),
                    },
                )?;
                Ok(user_id)
            })
            .await?;
        debug!(target: LOG_TARGET, %user_id, "User created");
        Ok(user_id)
    }

    pub async fn has_user(&self, user_id: UserId) -> DbResult<bool> {
        self.read_with(|tx| Ok(tx.open_table(&users::TABLE)?.get(&user_id)?.is_some()))
            .await
    }
}
