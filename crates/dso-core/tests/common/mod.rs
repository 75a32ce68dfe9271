//! Shared fixtures: a small schema pack resembling real datasets.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use dso_core::schema::{Dataset, Profile, SchemaSnapshot};

/// Datasets: open waste containers (with geometry and an FK), temporal
/// districts, parkeervakken behind a dataset scope with nested regimes,
/// and a movie catalog for value-parsing cases.
#[must_use]
pub fn snapshot() -> SchemaSnapshot {
    let afvalwegingen: Dataset = serde_json::from_value(serde_json::json!({
        "id": "afvalwegingen",
        "tables": [
            {
                "id": "containers",
                "fields": [
                    {"id": "id", "type": "integer"},
                    {"id": "serienummer", "type": "string"},
                    {"id": "eigenaarNaam", "type": "string"},
                    {"id": "datumCreatie", "type": "string", "format": "date"},
                    {"id": "datumLeegmaken", "type": "string", "format": "date-time"},
                    {"id": "cluster", "type": "string",
                     "relation": "afvalwegingen:clusters",
                     "relatedFieldIds": ["id"]},
                    {"id": "geometry", "type": "https://geojson.org/schema/Point.json"},
                ]
            },
            {
                "id": "clusters",
                "fields": [
                    {"id": "id", "type": "string"},
                    {"id": "status", "type": "string"},
                ],
                "additionalRelations": [
                    {"id": "containers", "table": "afvalwegingen:containers",
                     "field": "cluster", "format": "summary"}
                ]
            }
        ]
    }))
    .expect("valid dataset");

    let gebieden: Dataset = serde_json::from_value(serde_json::json!({
        "id": "gebieden",
        "tables": [
            {
                "id": "buurten",
                "identifier": ["identificatie", "volgnummer"],
                "temporal": {
                    "identifier": "volgnummer",
                    "dimensions": {
                        "geldigOp": {"start": "beginGeldigheid", "end": "eindGeldigheid"}
                    }
                },
                "fields": [
                    {"id": "identificatie", "type": "string"},
                    {"id": "volgnummer", "type": "integer"},
                    {"id": "naam", "type": "string"},
                    {"id": "beginGeldigheid", "type": "string", "format": "date"},
                    {"id": "eindGeldigheid", "type": "string", "format": "date"},
                    {"id": "ligtInWijk", "type": "string",
                     "relation": "gebieden:wijken",
                     "relatedFieldIds": ["identificatie", "volgnummer"]},
                ]
            },
            {
                "id": "wijken",
                "identifier": ["identificatie", "volgnummer"],
                "temporal": {
                    "identifier": "volgnummer",
                    "dimensions": {
                        "geldigOp": {"start": "beginGeldigheid", "end": "eindGeldigheid"}
                    }
                },
                "fields": [
                    {"id": "identificatie", "type": "string"},
                    {"id": "volgnummer", "type": "integer"},
                    {"id": "naam", "type": "string"},
                    {"id": "beginGeldigheid", "type": "string", "format": "date"},
                    {"id": "eindGeldigheid", "type": "string", "format": "date"},
                ],
                "additionalRelations": [
                    {"id": "buurt", "table": "gebieden:buurten",
                     "field": "ligtInWijk", "format": "embedded"}
                ]
            }
        ]
    }))
    .expect("valid dataset");

    let parkeervakken: Dataset = serde_json::from_value(serde_json::json!({
        "id": "parkeervakken",
        "auth": "DATASET/SCOPE",
        "tables": [{
            "id": "parkeervakken",
            "identifier": ["id"],
            "fields": [
                {"id": "id", "type": "string"},
                {"id": "type", "type": "string"},
                {"id": "buurtcode", "type": "string"},
                {"id": "regimes", "type": "array", "isNestedTable": true,
                 "subfields": [
                     {"id": "soort", "type": "string"},
                     {"id": "eindtijd", "type": "string", "format": "time"},
                 ]},
            ]
        }]
    }))
    .expect("valid dataset");

    let movies: Dataset = serde_json::from_value(serde_json::json!({
        "id": "movies",
        "tables": [{
            "id": "movie",
            "fields": [
                {"id": "id", "type": "integer"},
                {"id": "name", "type": "string"},
                {"id": "dateAdded", "type": "string", "format": "date-time"},
            ]
        }]
    }))
    .expect("valid dataset");

    let profile: Profile = serde_json::from_value(serde_json::json!({
        "name": "parkeerwacht",
        "scopes": ["PROFIEL/SCOPE"],
        "datasets": {
            "parkeervakken": {
                "tables": {
                    "parkeervakken": {
                        "mandatoryFilterSets": [
                            ["regimes.eindtijd"],
                        ]
                    }
                }
            }
        }
    }))
    .expect("valid profile");

    SchemaSnapshot::from_documents(
        vec![afvalwegingen, gebieden, parkeervakken, movies],
        vec![profile],
    )
    .expect("valid snapshot")
}

/// Split a query string literal into pairs (no URL decoding).
#[must_use]
pub fn query(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}
