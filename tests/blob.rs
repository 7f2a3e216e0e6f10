use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Result;
use futures_executor::block_on;
use squill::{Connection, Error};

fn with_blob(size: usize) -> Result<(Connection, i64)> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table images (data blob)")?;
    db.exec(
        &format!("insert into images values (zeroblob({}))", size),
        (),
    )?;

    let row = db.last_insert_rowid()?;

    Ok((db, row))
}

#[test]
fn length_is_cached_at_open() -> Result<()> {
    let (db, row) = with_blob(64)?;

    let blob = db.open_blob(None, "images", "data", row, false)?;

    assert_eq!(blob.byte_length(), 64);
    assert!(!blob.readonly());

    Ok(())
}

#[test]
fn positional_read_write() -> Result<()> {
    let (db, row) = with_blob(8)?;

    let blob = db.open_blob(None, "images", "data", row, false)?;

    blob.write_at(0, &[1, 2, 3, 4])?;
    blob.write_at(4, &[5, 6, 7, 8])?;

    let mut buf = [0u8; 8];
    blob.read_at(0, &mut buf)?;

    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

    let mut tail = [0u8; 2];
    blob.read_at(6, &mut tail)?;
    assert_eq!(tail, [7, 8]);

    Ok(())
}

#[test]
fn reads_and_writes_cannot_cross_the_end() -> Result<()> {
    let (db, row) = with_blob(4)?;

    let blob = db.open_blob(None, "images", "data", row, false)?;

    assert!(blob.write_at(2, &[0; 4]).is_err());
    assert!(blob.read_at(4, &mut [0; 1]).is_err());

    Ok(())
}

#[test]
fn readonly_blob_rejects_writes() -> Result<()> {
    let (db, row) = with_blob(4)?;

    let blob = db.open_blob(None, "images", "data", row, true)?;

    assert!(blob.readonly());
    assert!(matches!(blob.write_at(0, &[1]), Err(Error::Blob(_))));

    Ok(())
}

#[test]
fn async_read_write_round_trip() -> Result<()> {
    let (db, row) = with_blob(16)?;

    let blob = db.open_blob(None, "images", "data", row, false)?;

    block_on(async {
        let payload = (0u8..16).collect::<Vec<_>>();

        let payload = blob.write(0, payload).await?;
        assert_eq!(payload.len(), 16);

        let read = blob.read(0, vec![0; 16]).await?;
        assert_eq!(read, (0u8..16).collect::<Vec<_>>());

        let tail = blob.read(12, vec![0; 4]).await?;
        assert_eq!(tail, vec![12, 13, 14, 15]);

        Ok::<_, Error>(())
    })?;

    Ok(())
}

#[test]
fn chunk_iterator_yields_16k_chunks() -> Result<()> {
    let size = 40 * 1024;
    let (db, row) = with_blob(size)?;

    let blob = db.open_blob(None, "images", "data", row, false)?;

    let sizes = blob
        .chunks()
        .map(|chunk| chunk.map(|chunk| chunk.len()))
        .collect::<Result<Vec<_>, Error>>()?;

    assert_eq!(sizes, vec![16 * 1024, 16 * 1024, 8 * 1024]);

    Ok(())
}

#[test]
fn io_adapters_stream_the_blob() -> Result<()> {
    let (db, row) = with_blob(6)?;

    let mut blob = db.open_blob(None, "images", "data", row, false)?;

    blob.write_all(b"abcdef")?;

    blob.seek(SeekFrom::Start(0))?;
    let mut contents = Vec::new();
    blob.read_to_end(&mut contents)?;

    assert_eq!(contents, b"abcdef");

    // the writable stream rejects crossing the fixed length
    blob.seek(SeekFrom::End(-1))?;
    assert!(blob.write_all(b"xy").is_err());

    Ok(())
}

#[test]
fn close_is_idempotent_and_connection_close_wins() -> Result<()> {
    let (db, row) = with_blob(4)?;

    let blob = db.open_blob(None, "images", "data", row, false)?;

    blob.close();
    blob.close();

    assert!(matches!(blob.read_at(0, &mut [0; 1]), Err(Error::Misuse(_))));

    let other = db.open_blob(None, "images", "data", row, false)?;

    db.close();

    // closed along with its connection
    assert!(matches!(other.read_at(0, &mut [0; 1]), Err(Error::Misuse(_))));

    Ok(())
}
