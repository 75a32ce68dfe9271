//! PostgreSQL SQL generation from a [`QueryPlan`].
//!
//! All user-supplied data binds through `$n` placeholders; the SQL text only
//! ever contains identifiers taken from the schema (quoted) and literals the
//! planner produced from validated enums (SRIDs, tile numbers).

use dso_error::Result;

use super::{JoinKind, Predicate, QueryPlan, SelectExpr, SortDir, SqlValue};

/// A generated statement with its parameter values.
#[derive(Debug, Clone)]
pub struct SqlQuery {
    pub sql:    String,
    pub params: Vec<SqlValue>,
}

/// Generates parameterized statements from query plans.
pub struct SqlGenerator {
    params: Vec<SqlValue>,
}

impl SqlGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// The main SELECT for a plan.
    ///
    /// With pagination enabled the statement fetches one row beyond the page
    /// size; the paginator peeks at it to decide whether a `next` link exists.
    pub fn select(mut self, plan: &QueryPlan) -> Result<SqlQuery> {
        let mut sql = String::from("SELECT ");
        if plan.distinct {
            sql.push_str("DISTINCT ");
        }

        let exprs: Vec<String> = plan
            .selected
            .iter()
            .map(|sel| match &sel.expr {
                SelectExpr::Column => {
                    format!("{} AS \"{}\"", sel.column.sql(), sel.field_id)
                }
                SelectExpr::GeoJson { srid } => format!(
                    "ST_AsGeoJSON(ST_Transform({}, {srid})) AS \"{}\"",
                    sel.column.sql(),
                    sel.field_id
                ),
            })
            .collect();
        sql.push_str(&exprs.join(", "));

        self.push_from(&mut sql, plan);
        self.push_where(&mut sql, plan)?;

        if !plan.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            let order: Vec<String> = plan
                .order_by
                .iter()
                .map(|(column, dir)| {
                    let dir = match dir {
                        SortDir::Asc => "ASC",
                        SortDir::Desc => "DESC",
                    };
                    format!("{} {dir}", column.sql())
                })
                .collect();
            sql.push_str(&order.join(", "));
        }

        if plan.pagination.enabled {
            let size = plan.pagination.page_size;
            let offset = (plan.pagination.page - 1) * size;
            sql.push_str(&format!(" LIMIT {} OFFSET {offset}", size + 1));
        }

        Ok(SqlQuery {
            sql,
            params: self.params,
        })
    }

    /// The COUNT statement backing `?_count=true`.
    ///
    /// DISTINCT plans count distinct base identifiers so fanned-out joins
    /// don't inflate the total.
    pub fn count(mut self, plan: &QueryPlan) -> Result<SqlQuery> {
        let mut sql = if plan.distinct {
            let ids: Vec<String> = plan
                .identifier_columns
                .iter()
                .map(|col| format!("\"{}\".\"{col}\"", plan.base_alias))
                .collect();
            format!("SELECT COUNT(DISTINCT ({}))", ids.join(", "))
        } else {
            String::from("SELECT COUNT(*)")
        };

        self.push_from(&mut sql, plan);
        self.push_where(&mut sql, plan)?;

        Ok(SqlQuery {
            sql,
            params: self.params,
        })
    }

    /// A Mapbox Vector Tile statement for tile `(z, x, y)`.
    ///
    /// The tile envelope is computed server-side; the geometry is clipped and
    /// quantized by `ST_AsMVTGeom`. The statement returns a single row whose
    /// first column is the encoded tile (NULL when no features intersect).
    pub fn tile(
        mut self,
        plan: &QueryPlan,
        layer: &str,
        geometry_column: &str,
        z: u32,
        x: u32,
        y: u32,
    ) -> Result<SqlQuery> {
        let geom = format!("\"{}\".\"{geometry_column}\"", plan.base_alias);

        let mut properties = String::new();
        for sel in &plan.selected {
            if matches!(sel.expr, SelectExpr::GeoJson { .. }) {
                continue;
            }
            properties.push_str(&format!(", {} AS \"{}\"", sel.column.sql(), sel.field_id));
        }

        let mut inner = format!(
            "SELECT ST_AsMVTGeom(ST_Transform({geom}, 3857), \
             ST_TileEnvelope({z}, {x}, {y}), 4096, 64, true) AS geom{properties}"
        );
        self.push_from(&mut inner, plan);

        let mut where_parts = vec![format!(
            "ST_Transform({geom}, 3857) && ST_TileEnvelope({z}, {x}, {y})"
        )];
        for predicate in &plan.where_terms {
            where_parts.push(self.predicate_sql(predicate)?);
        }
        inner.push_str(" WHERE ");
        inner.push_str(&where_parts.join(" AND "));

        let sql = format!(
            "SELECT ST_AsMVT(tile, '{layer}', 4096, 'geom') FROM ({inner}) AS tile \
             WHERE tile.geom IS NOT NULL"
        );

        Ok(SqlQuery {
            sql,
            params: self.params,
        })
    }

    fn push_from(&self, sql: &mut String, plan: &QueryPlan) {
        sql.push_str(&format!(
            " FROM \"{}\" AS \"{}\"",
            plan.db_table, plan.base_alias
        ));
        for join in &plan.joins {
            let kind = match join.kind {
                JoinKind::Left => "LEFT JOIN",
                JoinKind::Inner => "JOIN",
            };
            let on: Vec<String> = join
                .on
                .iter()
                .map(|(left, right)| format!("{} = {}", left.sql(), right.sql()))
                .collect();
            sql.push_str(&format!(
                " {kind} \"{}\" AS \"{}\" ON {}",
                join.db_table,
                join.alias,
                on.join(" AND ")
            ));
        }
    }

    fn push_where(&mut self, sql: &mut String, plan: &QueryPlan) -> Result<()> {
        if plan.where_terms.is_empty() {
            return Ok(());
        }
        let parts: Vec<String> = plan
            .where_terms
            .iter()
            .map(|p| self.predicate_sql(p))
            .collect::<Result<_>>()?;
        sql.push_str(" WHERE ");
        sql.push_str(&parts.join(" AND "));
        Ok(())
    }

    fn next_param(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    fn predicate_sql(&mut self, predicate: &Predicate) -> Result<String> {
        Ok(match predicate {
            Predicate::Compare {
                column,
                op,
                value,
                case_insensitive,
            } => {
                if *case_insensitive {
                    let param = self.next_param(value.uppercased());
                    format!("UPPER({}) {} {param}", column.sql(), op.sql())
                } else {
                    let param = self.next_param(value.clone());
                    format!("{} {} {param}", column.sql(), op.sql())
                }
            }

            Predicate::CompareDate { column, op, date } => {
                let param = self.next_param(SqlValue::Date(*date));
                format!("date({}) {} {param}", column.sql(), op.sql())
            }

            Predicate::NotEqual {
                column,
                values,
                case_insensitive,
            } => {
                let parts: Vec<String> = values
                    .iter()
                    .map(|value| {
                        if *case_insensitive {
                            let param = self.next_param(value.uppercased());
                            format!(
                                "({col} IS NULL OR UPPER({col}) != {param})",
                                col = column.sql()
                            )
                        } else {
                            let param = self.next_param(value.clone());
                            format!("({col} IS NULL OR {col} != {param})", col = column.sql())
                        }
                    })
                    .collect();
                if parts.len() == 1 {
                    parts.into_iter().next().unwrap_or_default()
                } else {
                    format!("({})", parts.join(" AND "))
                }
            }

            Predicate::In { column, values } => {
                let params: Vec<String> = values
                    .iter()
                    .map(|value| self.next_param(value.clone()))
                    .collect();
                format!("{} IN ({})", column.sql(), params.join(", "))
            }

            Predicate::IsNull { column, negate } => {
                if *negate {
                    format!("{} IS NOT NULL", column.sql())
                } else {
                    format!("{} IS NULL", column.sql())
                }
            }

            Predicate::IsEmpty { column, empty } => {
                // (null = '') yields NULL, not false; IS [NOT] FALSE keeps
                // the three-valued logic honest.
                if *empty {
                    format!("({} = '') IS NOT FALSE", column.sql())
                } else {
                    format!("({} = '') IS FALSE", column.sql())
                }
            }

            Predicate::Like {
                column,
                pattern,
                case_insensitive,
            } => {
                if *case_insensitive {
                    let param = self.next_param(SqlValue::Text(pattern.to_uppercase()));
                    format!("UPPER({}) LIKE {param}", column.sql())
                } else {
                    let param = self.next_param(SqlValue::Text(pattern.clone()));
                    format!("{} LIKE {param}", column.sql())
                }
            }

            Predicate::ArrayContains { column, values } => {
                let params: Vec<String> = values
                    .iter()
                    .map(|value| self.next_param(SqlValue::Text(value.to_uppercase())))
                    .collect();
                format!(
                    "(ARRAY(SELECT UPPER(x) FROM unnest({}) AS x)) @> ARRAY[{}]",
                    column.sql(),
                    params.join(", ")
                )
            }

            Predicate::ArrayEquals { column, values } => {
                let params: Vec<String> = values
                    .iter()
                    .map(|value| self.next_param(value.clone()))
                    .collect();
                format!("{} = ARRAY[{}]", column.sql(), params.join(", "))
            }

            Predicate::GeoContains { column, x, y, srid } => {
                let px = self.next_param(SqlValue::Float(*x));
                let py = self.next_param(SqlValue::Float(*y));
                format!(
                    "ST_Contains({col}, ST_Transform(ST_SetSRID(ST_MakePoint({px}, {py}), \
                     {srid}), ST_SRID({col})))",
                    col = column.sql()
                )
            }

            Predicate::GeoEquals {
                column,
                x,
                y,
                srid,
                negate,
            } => {
                let px = self.next_param(SqlValue::Float(*x));
                let py = self.next_param(SqlValue::Float(*y));
                let expr = format!(
                    "ST_Equals({col}, ST_Transform(ST_SetSRID(ST_MakePoint({px}, {py}), \
                     {srid}), ST_SRID({col})))",
                    col = column.sql()
                );
                if *negate {
                    format!("NOT {expr}")
                } else {
                    expr
                }
            }

            Predicate::TemporalRange { start, end, value } => {
                let p1 = self.next_param(value.clone());
                let p2 = self.next_param(value.clone());
                format!(
                    "({} <= {p1} AND ({end} > {p2} OR {end} IS NULL))",
                    start.sql(),
                    end = end.sql()
                )
            }

            Predicate::LatestSequence {
                alias,
                db_table,
                identifier,
                sequence,
            } => {
                format!(
                    "(\"{alias}\".\"{identifier}\", \"{alias}\".\"{sequence}\") IN \
                     (SELECT \"{identifier}\", MAX(\"{sequence}\") FROM \"{db_table}\" \
                     GROUP BY \"{identifier}\")"
                )
            }

            Predicate::OrNull { column, inner } => {
                let inner_sql = self.predicate_sql(inner)?;
                format!("({} IS NULL OR {inner_sql})", column.sql())
            }
        })
    }
}

impl Default for SqlGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::UserScopes;
    use crate::plan::{Planner, PlannerOptions, QueryParams};
    use crate::schema::{Dataset, SchemaSnapshot};

    fn snapshot() -> SchemaSnapshot {
        let dataset: Dataset = serde_json::from_value(serde_json::json!({
            "id": "afvalwegingen",
            "tables": [{
                "id": "containers",
                "fields": [
                    {"id": "id", "type": "integer"},
                    {"id": "serienummer", "type": "string"},
                    {"id": "datumLeegmaken", "type": "string", "format": "date-time"},
                    {"id": "geometry", "type": "https://geojson.org/schema/Point.json"},
                ]
            }]
        }))
        .unwrap();
        SchemaSnapshot::from_documents(vec![dataset], vec![]).unwrap()
    }

    fn plan(query: &[(&str, &str)]) -> crate::plan::QueryPlan {
        let snapshot = snapshot();
        let dataset = snapshot.dataset("afvalwegingen").unwrap();
        let table = dataset.table("containers").unwrap();
        let user = UserScopes::new([], []);
        let planner = Planner::new(&snapshot, dataset, table, &user, PlannerOptions::default());
        let pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        planner
            .plan_list(&QueryParams::parse(&pairs).unwrap(), true)
            .unwrap()
    }

    #[test]
    fn test_select_is_fully_parameterized() {
        let query = SqlGenerator::new()
            .select(&plan(&[("serienummer", "Robert'); DROP TABLE containers;--")]))
            .unwrap();

        // The malicious value only exists in the parameter list.
        assert!(!query.sql.contains("DROP TABLE"));
        assert_eq!(query.params.len(), 1);
        assert!(query.sql.contains("\"t\".\"serienummer\" = $1"));
    }

    #[test]
    fn test_select_shape() {
        let query = SqlGenerator::new().select(&plan(&[])).unwrap();
        assert!(query.sql.starts_with("SELECT "));
        assert!(query
            .sql
            .contains("FROM \"afvalwegingen_containers\" AS \"t\""));
        // Default page: peek one row beyond the page size.
        assert!(query.sql.ends_with("LIMIT 21 OFFSET 0"));
    }

    #[test]
    fn test_geometry_select_transforms() {
        let query = SqlGenerator::new().select(&plan(&[])).unwrap();
        assert!(query
            .sql
            .contains("ST_AsGeoJSON(ST_Transform(\"t\".\"geometry\", 4326)) AS \"geometry\""));
    }

    #[test]
    fn test_placeholder_count_matches_params() {
        let query = SqlGenerator::new()
            .select(&plan(&[
                ("serienummer[in]", "a,b,c"),
                ("datumLeegmaken[gte]", "2021-01-01"),
            ]))
            .unwrap();
        let placeholders = (1..=query.params.len())
            .map(|n| format!("${n}"))
            .filter(|p| query.sql.contains(p.as_str()))
            .count();
        assert_eq!(placeholders, query.params.len());
        assert_eq!(query.params.len(), 4);
    }

    #[test]
    fn test_date_promotion_sql() {
        let query = SqlGenerator::new()
            .select(&plan(&[("datumLeegmaken", "2021-01-01")]))
            .unwrap();
        assert!(query.sql.contains("date(\"t\".\"datum_leegmaken\") = $1"));
    }

    #[test]
    fn test_isempty_three_valued_logic() {
        let query = SqlGenerator::new()
            .select(&plan(&[("serienummer[isempty]", "true")]))
            .unwrap();
        assert!(query
            .sql
            .contains("(\"t\".\"serienummer\" = '') IS NOT FALSE"));

        let query = SqlGenerator::new()
            .select(&plan(&[("serienummer[isempty]", "false")]))
            .unwrap();
        assert!(query.sql.contains("(\"t\".\"serienummer\" = '') IS FALSE"));
    }

    #[test]
    fn test_not_lookup_null_tolerant_and_uppercased() {
        let query = SqlGenerator::new()
            .select(&plan(&[("serienummer[not]", "abc")]))
            .unwrap();
        assert!(query.sql.contains(
            "(\"t\".\"serienummer\" IS NULL OR UPPER(\"t\".\"serienummer\") != $1)"
        ));
        assert_eq!(query.params[0], SqlValue::Text("ABC".to_string()));
    }

    #[test]
    fn test_like_uppercases_pattern() {
        let query = SqlGenerator::new()
            .select(&plan(&[("serienummer[like]", "foo*")]))
            .unwrap();
        assert!(query.sql.contains("UPPER(\"t\".\"serienummer\") LIKE $1"));
        assert_eq!(query.params[0], SqlValue::Text("FOO%".to_string()));
    }

    #[test]
    fn test_geo_contains_sql() {
        let query = SqlGenerator::new()
            .select(&plan(&[("geometry[contains]", "52.373,4.893")]))
            .unwrap();
        assert!(query.sql.contains("ST_Contains(\"t\".\"geometry\""));
        assert!(query.sql.contains("ST_SetSRID(ST_MakePoint($1, $2), 4326)"));
    }

    #[test]
    fn test_count_query() {
        let query = SqlGenerator::new().count(&plan(&[])).unwrap();
        assert!(query.sql.starts_with("SELECT COUNT(*)"));
        assert!(!query.sql.contains("LIMIT"));
    }

    #[test]
    fn test_tile_query() {
        let query = SqlGenerator::new()
            .tile(&plan(&[]), "containers", "geometry", 17, 67327, 43077)
            .unwrap();
        assert!(query.sql.contains("ST_AsMVT(tile, 'containers', 4096, 'geom')"));
        assert!(query.sql.contains("ST_TileEnvelope(17, 67327, 43077)"));
        assert!(query.sql.contains("ST_AsMVTGeom"));
    }
}
