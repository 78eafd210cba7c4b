use slumber_util_error::BoxedErrorResult;

use crate::tests::temp_db;
use crate::{Database, def_table};

def_table!(test_table: (u64, u64) => String);

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn paginate_partition_rev() -> BoxedErrorResult<()> {
    let (_dir, db, _log) = temp_db().await?;

    db.write_with(|tx| {
        let mut table = tx.open_table(&test_table::TABLE)?;

        table.insert(&(1, 0), "Other")?;
        table.insert(&(2, 0), "Zero")?;
        table.insert(&(2, 3), "Three")?;
        table.insert(&(2, 7), "Seven")?;
        table.insert(&(3, 1), "Other")?;

        let page = |cursor: Option<u64>, limit| {
            Database::paginate_table_partition_rev(
                &table,
                (2, 0)..=(2, u64::MAX),
                |c| (2, c),
                cursor,
                limit,
                |k, v| Ok(Some(format!("{}-{v}", k.1))),
            )
        };

        assert_eq!(page(None, 0)?, Vec::<String>::new());
        assert_eq!(
            page(None, 2)?,
            vec!["7-Seven".to_owned(), "3-Three".to_owned()]
        );
        assert_eq!(page(Some(7), 2)?, vec!["3-Three".to_owned(), "0-Zero".to_owned()]);
        assert_eq!(page(Some(3), 5)?, vec!["0-Zero".to_owned()]);
        assert_eq!(page(Some(0), 5)?, Vec::<String>::new());
        assert_eq!(
            page(Some(40), 5)?,
            vec!["7-Seven".to_owned(), "3-Three".to_owned(), "0-Zero".to_owned()]
        );

        let even = Database::paginate_table_partition_rev(
            &table,
            (2, 0)..=(2, u64::MAX),
            |c: u64| (2, c),
            None,
            5,
            |k, v| Ok((k.1 % 2 == 0).then_some(v)),
        )?;
        assert_eq!(even, vec!["Zero".to_owned()]);

        Ok(())
    })
    .await?;

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn paginate_partition_forward() -> BoxedErrorResult<()> {
    let (_dir, db, _log) = temp_db().await?;

    db.write_with(|tx| {
        let mut table = tx.open_table(&test_table::TABLE)?;

        table.insert(&(1, 9), "Other")?;
        table.insert(&(2, 0), "Zero")?;
        table.insert(&(2, 3), "Three")?;
        table.insert(&(2, 7), "Seven")?;
        table.insert(&(3, 1), "Other")?;

        let page = |cursor: Option<u64>, limit| {
            Database::paginate_table_partition(
                &table,
                (2, 0)..=(2, u64::MAX),
                |c| (2, c),
                cursor,
                limit,
                |_k, v| Ok(Some(v)),
            )
        };

        assert_eq!(page(None, 2)?, vec!["Zero".to_owned(), "Three".to_owned()]);
        assert_eq!(page(Some(3), 2)?, vec!["Seven".to_owned()]);
        // Cursors between stored keys resume at the next key
        assert_eq!(page(Some(1), 1)?, vec!["Three".to_owned()]);
        assert_eq!(page(Some(7), 2)?, Vec::<String>::new());

        Ok(())
    })
    .await?;

    Ok(())
}
