//! Shared helpers for the stage tests: temp stores, temp data dirs, and a
//! small hand-built Olist-shaped dataset.

use std::path::{Path, PathBuf};

use starload_shared::{RunConfig, ValidateConfig, parse_base_url};
use starload_storage::Store;
use uuid::Uuid;

use crate::dimensions::build_dimensions;
use crate::facts::build_facts;
use crate::views::create_views;

/// Create a temp file store for testing.
pub(crate) async fn test_store() -> Store {
    let tmp = std::env::temp_dir().join(format!("starload_test_{}.db", Uuid::now_v7()));
    Store::open(&tmp).await.expect("open test db")
}

/// Create a fresh temp directory holding `files` as `(name, contents)`.
pub(crate) fn write_fixture_dir(files: &[(&str, &str)]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("starload_data_{}", Uuid::now_v7()));
    std::fs::create_dir_all(&dir).expect("create data dir");
    for (name, contents) in files {
        std::fs::write(dir.join(name), contents).expect("write fixture file");
    }
    dir
}

/// Run config reading from and extracting into `data_dir`, with bulk
/// loading on and a tiny batch size so batching is exercised.
pub(crate) fn test_run_config(data_dir: &Path) -> RunConfig {
    RunConfig {
        base_url: parse_base_url(&format!("file://{}", data_dir.display())).expect("file url"),
        timeout_secs: 5,
        data_dir: data_dir.to_path_buf(),
        bulk_load_enabled: true,
        batch_rows: 3,
        validate: ValidateConfig::default(),
    }
}

/// Clean staging rows for a small marketplace.
///
/// - `u1` places one order, `u2` two, `u3` three; `u4` only cancels.
/// - `o1` arrives a day after its estimate; `o2` is canceled and `o7` is
///   still in transit, so both lack a delivery date.
/// - `p3` has no category and `portateis_cozinha` has no translation.
const MINIMAL_STAR: &str = r#"
INSERT INTO stg_geolocation VALUES
    ('01037', -23.54, -46.63, 'sao paulo', 'SP'),
    ('01037', -23.56, -46.65, 'sao paulo', 'SP'),
    ('13023', -22.90, -47.06, 'campinas', 'SP'),
    ('20040', -22.90, -43.17, 'rio de janeiro', 'RJ');

INSERT INTO stg_customers VALUES
    ('c1', 'u1', '01037', 'sao paulo', 'SP'),
    ('c2', 'u2', '20040', 'rio de janeiro', 'RJ'),
    ('c3', 'u2', '20040', 'rio de janeiro', 'RJ'),
    ('c4', 'u3', '13023', 'campinas', 'SP'),
    ('c5', 'u3', '13023', 'campinas', 'SP'),
    ('c6', 'u3', '13023', 'campinas', 'SP'),
    ('c7', 'u4', '99990', 'ijui', 'RS');

INSERT INTO stg_sellers VALUES
    ('s1', '01037', 'sao paulo', 'SP'),
    ('s2', '13023', 'campinas', 'SP');

INSERT INTO stg_products VALUES
    ('p1', 'cama_mesa_banho', 40, 287, 1, 225, 16, 10, 14),
    ('p2', 'portateis_cozinha', 55, 900, 2, 1000, 30, 20, 20),
    ('p3', NULL, NULL, NULL, NULL, 300, 20, 10, 15);

INSERT INTO stg_category_translation VALUES
    ('cama_mesa_banho', 'bed_bath_table'),
    ('beleza_saude', 'health_beauty');

INSERT INTO stg_orders VALUES
    ('o1', 'c1', 'delivered', '2017-01-05 10:00:00', '2017-01-05 11:00:00', '2017-01-07 09:00:00', '2017-01-13 15:00:00', '2017-01-12 00:00:00'),
    ('o2', 'c7', 'canceled',  '2017-01-20 09:00:00', NULL, NULL, NULL, '2017-02-10 00:00:00'),
    ('o3', 'c2', 'delivered', '2017-02-01 10:00:00', '2017-02-01 12:00:00', '2017-02-02 08:00:00', '2017-02-05 10:00:00', '2017-02-20 00:00:00'),
    ('o4', 'c3', 'delivered', '2017-03-10 08:00:00', '2017-03-10 09:00:00', '2017-03-11 08:00:00', '2017-03-15 16:00:00', '2017-03-30 00:00:00'),
    ('o5', 'c4', 'delivered', '2017-02-10 14:00:00', '2017-02-10 15:00:00', '2017-02-11 08:00:00', '2017-02-12 18:00:00', '2017-02-25 00:00:00'),
    ('o6', 'c5', 'delivered', '2017-03-01 07:00:00', '2017-03-01 08:00:00', '2017-03-02 08:00:00', '2017-03-04 12:00:00', '2017-03-20 00:00:00'),
    ('o7', 'c6', 'shipped',   '2017-04-01 19:00:00', '2017-04-01 20:00:00', '2017-04-03 08:00:00', NULL, '2017-04-20 00:00:00');

INSERT INTO stg_order_items VALUES
    ('o1', 1, 'p1', 's1', '2017-01-09 10:00:00', 100.0, 12.0),
    ('o1', 2, 'p2', 's2', '2017-01-09 10:00:00', 50.0, 8.0),
    ('o2', 1, 'p2', 's1', '2017-01-24 09:00:00', 30.0, 5.0),
    ('o3', 1, 'p1', 's1', '2017-02-05 10:00:00', 40.0, 10.0),
    ('o4', 1, 'p3', 's2', '2017-03-14 08:00:00', 25.0, 5.0),
    ('o5', 1, 'p2', 's2', '2017-02-14 14:00:00', 60.0, 6.0),
    ('o6', 1, 'p1', 's1', '2017-03-05 07:00:00', 20.0, 4.0),
    ('o7', 1, 'p3', 's1', '2017-04-05 19:00:00', 10.0, 2.0);

INSERT INTO stg_order_payments VALUES
    ('o1', 1, 'credit_card', 3, 100.0),
    ('o1', 2, 'voucher', 1, 70.0),
    ('o2', 1, 'boleto', 1, 35.0),
    ('o3', 1, 'credit_card', 1, 50.0),
    ('o4', 1, 'debit_card', 1, 30.0),
    ('o5', 1, 'credit_card', 2, 66.0),
    ('o6', 1, 'boleto', 1, 24.0),
    ('o7', 1, 'credit_card', 1, 12.0);

INSERT INTO stg_order_reviews VALUES
    ('r1', 'o1', 2, NULL, 'chegou atrasado', '2017-01-14 00:00:00', '2017-01-15 10:00:00'),
    ('r3', 'o3', 5, NULL, NULL, '2017-02-06 00:00:00', '2017-02-06 12:00:00'),
    ('r4', 'o4', 4, NULL, NULL, '2017-03-16 00:00:00', '2017-03-17 09:00:00'),
    ('r5', 'o5', 5, 'otimo', 'recomendo', '2017-02-13 00:00:00', '2017-02-13 20:00:00'),
    ('r6', 'o6', 3, NULL, NULL, '2017-03-05 00:00:00', '2017-03-06 08:00:00');
"#;

/// Fill staging with [`MINIMAL_STAR`].
pub(crate) async fn seed_minimal_star(store: &Store) {
    store
        .execute_batch(MINIMAL_STAR)
        .await
        .expect("seed staging");
}

/// Seed staging and build dimensions, facts, and views on top.
pub(crate) async fn build_minimal_star(store: &Store) {
    seed_minimal_star(store).await;
    build_dimensions(store).await.expect("dimensions");
    build_facts(store).await.expect("facts");
    create_views(store).await.expect("views");
}
