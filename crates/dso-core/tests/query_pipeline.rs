//! End-to-end tests over parse → authorize → plan → SQL, without a database.
//!
//! These mirror the observable behavior of the HTTP endpoints: the same
//! inputs, checked at the query-plan and generated-SQL level.

#![allow(clippy::unwrap_used)]

mod common;

use common::{query, snapshot};

use dso_core::auth::{check_filter_access, check_table_access, UserScopes};
use dso_core::plan::{Planner, PlannerOptions, Predicate, QueryParams, SqlGenerator};
use dso_error::ApiError;

fn user_with(scopes: &[&str], query_keys: &[&str]) -> UserScopes {
    UserScopes::new(
        scopes.iter().map(ToString::to_string),
        query_keys.iter().map(ToString::to_string),
    )
}

// ----------------------------------------------------------------------
// Scenario: profile access to parkeervakken requires the mandatory filter
// ----------------------------------------------------------------------

#[test]
fn parkeervakken_with_mandatory_filter_is_granted() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("parkeervakken").unwrap();
    let table = dataset.table("parkeervakken").unwrap();

    let user = user_with(&["PROFIEL/SCOPE"], &["regimes.eindtijd"]);
    let decision = check_table_access(
        &snapshot,
        &user,
        dataset,
        table,
        "GET",
        "/v1/parkeervakken/parkeervakken/",
    )
    .unwrap();
    assert_eq!(decision.matched_profiles, vec!["parkeerwacht"]);

    // The filter itself also lowers to a plan with a nested-table join.
    let params =
        QueryParams::parse(&query(&[("regimes.eindtijd", "20:05")])).unwrap();
    check_filter_access(&snapshot, &user, dataset, table, &params.filters).unwrap();

    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
    let plan = planner.plan_list(&params, true).unwrap();
    assert!(plan.distinct);
    assert_eq!(plan.joins.len(), 1);
    assert_eq!(plan.joins[0].db_table, "parkeervakken_parkeervakken_regimes");
}

#[test]
fn parkeervakken_without_mandatory_filter_is_denied() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("parkeervakken").unwrap();
    let table = dataset.table("parkeervakken").unwrap();

    let user = user_with(&["PROFIEL/SCOPE"], &[]);
    let err = check_table_access(
        &snapshot,
        &user,
        dataset,
        table,
        "GET",
        "/v1/parkeervakken/parkeervakken/",
    )
    .unwrap_err();
    assert!(matches!(err, ApiError::AccessDenied { .. }));
}

// ----------------------------------------------------------------------
// Scenario: invalid date-time value reports the offending parameter
// ----------------------------------------------------------------------

#[test]
fn movie_date_added_fubar_is_a_field_validation_error() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("movies").unwrap();
    let table = dataset.table("movie").unwrap();
    let user = user_with(&[], &["dateAdded"]);

    let params = QueryParams::parse(&query(&[("dateAdded", "2020-01-fubar")])).unwrap();
    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
    let err = planner.plan_list(&params, true).unwrap_err();

    let problem = err.to_problem(Some("http://testserver/v1/movies/movie/"));
    assert_eq!(problem.status, 400);
    let params = problem.invalid_params.expect("invalid-params");
    assert_eq!(params[0].name, "dateAdded");
    assert_eq!(
        params[0].reason,
        "Enter a valid ISO date-time, or single date."
    );
}

// ----------------------------------------------------------------------
// Temporal slices
// ----------------------------------------------------------------------

#[test]
fn temporal_default_slice_limits_to_one_row_per_identifier() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("gebieden").unwrap();
    let table = dataset.table("buurten").unwrap();
    let user = user_with(&[], &[]);

    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
    let plan = planner
        .plan_list(&QueryParams::parse(&[]).unwrap(), true)
        .unwrap();

    // Latest slice: one (identifier, MAX(sequence)) group per identifier.
    let sql = SqlGenerator::new().select(&plan).unwrap().sql;
    assert!(sql.contains(
        "(\"t\".\"identificatie\", \"t\".\"volgnummer\") IN \
         (SELECT \"identificatie\", MAX(\"volgnummer\") FROM \"gebieden_buurten\" \
         GROUP BY \"identificatie\")"
    ));
}

#[test]
fn temporal_sequence_pin_beats_dimension() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("gebieden").unwrap();
    let table = dataset.table("buurten").unwrap();
    let user = user_with(&[], &[]);

    let params = QueryParams::parse(&query(&[
        ("volgnummer", "2"),
        ("geldigOp", "2021-01-01"),
    ]))
    .unwrap();
    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
    let plan = planner.plan_detail("03630000000078", &params).unwrap();

    let sql = SqlGenerator::new().select(&plan).unwrap();
    assert!(sql.sql.contains("\"t\".\"volgnummer\" = $"));
    assert!(!sql.sql.contains("MAX("));
    // The identifier and the pinned sequence both bind as parameters.
    assert_eq!(sql.params.len(), 2);
}

#[test]
fn temporal_dimension_slice_generates_range_predicate() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("gebieden").unwrap();
    let table = dataset.table("buurten").unwrap();
    let user = user_with(&[], &[]);

    let params = QueryParams::parse(&query(&[("geldigOp", "2021-06-01")])).unwrap();
    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
    let plan = planner.plan_list(&params, true).unwrap();

    let sql = SqlGenerator::new().select(&plan).unwrap().sql;
    assert!(sql.contains("\"t\".\"begin_geldigheid\" <= $"));
    assert!(sql.contains("\"t\".\"eind_geldigheid\" > $"));
    assert!(sql.contains("\"t\".\"eind_geldigheid\" IS NULL"));
}

#[test]
fn temporal_join_optimization_uses_local_fk_columns() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("gebieden").unwrap();
    let table = dataset.table("buurten").unwrap();
    let user = user_with(&[], &[]);

    // ligtInWijk.identificatie matches relatedFieldIds: no join needed.
    let params =
        QueryParams::parse(&query(&[("ligtInWijk.identificatie", "03630012052035")])).unwrap();
    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
    let plan = planner.plan_list(&params, true).unwrap();

    assert!(plan.joins.is_empty());
    assert!(plan.where_terms.iter().any(|p| matches!(
        p,
        Predicate::Compare { column, .. } if column.column == "ligt_in_wijk_identificatie"
    )));
}

// ----------------------------------------------------------------------
// Sort permission enforcement
// ----------------------------------------------------------------------

#[test]
fn sort_on_protected_field_is_denied_not_invalid() {
    let dataset: dso_core::schema::Dataset = serde_json::from_value(serde_json::json!({
        "id": "brp",
        "tables": [{
            "id": "personen",
            "fields": [
                {"id": "id", "type": "integer"},
                {"id": "bsn", "type": "string", "auth": "BRP/RSN"},
            ]
        }]
    }))
    .unwrap();
    let snapshot =
        dso_core::schema::SchemaSnapshot::from_documents(vec![dataset], vec![]).unwrap();
    let dataset = snapshot.dataset("brp").unwrap();
    let table = dataset.table("personen").unwrap();
    let user = user_with(&[], &[]);

    let params = QueryParams::parse(&query(&[("_sort", "bsn")])).unwrap();
    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
    let err = planner.plan_list(&params, true).unwrap_err();
    // 403, not 400: sorting would leak values through row ordering.
    assert!(matches!(err, ApiError::AccessDenied { .. }));
}

// ----------------------------------------------------------------------
// Injection resistance
// ----------------------------------------------------------------------

#[test]
fn user_text_never_reaches_sql() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("afvalwegingen").unwrap();
    let table = dataset.table("containers").unwrap();
    let user = user_with(&[], &[]);
    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());

    for hostile in [
        "'; DROP TABLE afvalwegingen_containers; --",
        "\" OR 1=1 --",
        "$1; DELETE FROM x",
        "normal' UNION SELECT * FROM pg_user --",
    ] {
        let params =
            QueryParams::parse(&query(&[("serienummer", hostile)])).unwrap();
        let plan = planner.plan_list(&params, true).unwrap();
        let sql = SqlGenerator::new().select(&plan).unwrap();

        assert!(!sql.sql.contains(hostile), "hostile text leaked: {}", sql.sql);
        assert!(!sql.sql.contains("DROP TABLE"));
        assert!(!sql.sql.contains("UNION SELECT"));
        assert_eq!(sql.params.len(), 1);
    }
}

#[test]
fn like_pattern_is_escaped_and_parameterized() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("afvalwegingen").unwrap();
    let table = dataset.table("containers").unwrap();
    let user = user_with(&[], &[]);
    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());

    let params =
        QueryParams::parse(&query(&[("serienummer[like]", "100%_x*?")])).unwrap();
    let plan = planner.plan_list(&params, true).unwrap();
    let sql = SqlGenerator::new().select(&plan).unwrap();

    // The raw pattern only exists in the parameter list, pre-escaped.
    match &sql.params[0] {
        dso_core::plan::SqlValue::Text(pattern) => {
            assert_eq!(pattern, "100\\%\\_X%_");
        }
        other => panic!("unexpected param {other:?}"),
    }
}

// ----------------------------------------------------------------------
// Projection and expansion validation
// ----------------------------------------------------------------------

#[test]
fn expand_scope_of_summary_relation_is_rejected() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("afvalwegingen").unwrap();
    let table = dataset.table("clusters").unwrap();
    let user = user_with(&[], &[]);

    let params = QueryParams::parse(&query(&[("_expandScope", "containers")])).unwrap();
    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
    let err = planner.plan_list(&params, true).unwrap_err();
    assert!(err
        .to_string()
        .contains("not available for embedding as it's a summary of a huge listing"));
}

#[test]
fn expand_true_includes_forward_relations() {
    let snapshot = snapshot();
    let dataset = snapshot.dataset("gebieden").unwrap();
    let table = dataset.table("buurten").unwrap();
    let user = user_with(&[], &[]);

    let params = QueryParams::parse(&query(&[("_expand", "true")])).unwrap();
    let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
    let plan = planner.plan_list(&params, true).unwrap();
    assert!(plan.prefetch.contains(&"ligtInWijk".to_string()));
}
