//! CSV input with typed headers.
//!
//! Node files carry an id column (`:ID`, `name:ID` or `:ID(group)`), an optional
//! `:LABEL` column whose labels are separated by `;` or `|`, and property
//! columns named `key` or `key:type`. Relationship files carry `:START_ID`,
//! `:END_ID` (both optionally with a group) and `:TYPE`. Columns typed
//! `:IGNORE` are skipped. Empty fields mean "no value".

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use csv::{Reader, ReaderBuilder, StringRecord, Trim};
use tracing::debug;

use super::{parse_input_id, Estimates, Groups, IdType, Input, InputChunk, InputEntity, InputIterator};
use crate::types::{ImportError, Result, Value};

const SAMPLE_ROWS: usize = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ValueKind {
    Str,
    Int,
    Float,
    Bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Column {
    Id {
        property: Option<String>,
        group: Option<String>,
    },
    Label,
    StartId {
        group: Option<String>,
    },
    EndId {
        group: Option<String>,
    },
    Type,
    Ignore,
    Property {
        key: String,
        kind: ValueKind,
    },
}

fn split_group(field: &str) -> Result<(&str, Option<String>)> {
    match field.find('(') {
        None => Ok((field, None)),
        Some(open) => {
            let close = field
                .rfind(')')
                .filter(|close| *close > open)
                .ok_or_else(|| ImportError::invalid(format!("unbalanced group in header '{field}'")))?;
            Ok((&field[..open], Some(field[open + 1..close].to_owned())))
        }
    }
}

fn parse_column(header: &str) -> Result<Column> {
    let (name, kind) = match header.rfind(':') {
        Some(colon) => (&header[..colon], &header[colon + 1..]),
        None => (header, ""),
    };
    let (kind, group) = split_group(kind)?;
    let column = match kind.to_ascii_uppercase().as_str() {
        "ID" => Column::Id {
            property: (!name.is_empty()).then(|| name.to_owned()),
            group,
        },
        "LABEL" => Column::Label,
        "START_ID" => Column::StartId { group },
        "END_ID" => Column::EndId { group },
        "TYPE" => Column::Type,
        "IGNORE" => Column::Ignore,
        other => {
            if name.is_empty() {
                return Err(ImportError::invalid(format!("header '{header}' has no name")));
            }
            let kind = match other {
                "" | "STRING" | "CHAR" => ValueKind::Str,
                "INT" | "LONG" | "SHORT" | "BYTE" => ValueKind::Int,
                "FLOAT" | "DOUBLE" => ValueKind::Float,
                "BOOLEAN" => ValueKind::Bool,
                _ => {
                    return Err(ImportError::invalid(format!(
                        "unsupported column type '{other}' in header '{header}'"
                    )))
                }
            };
            Column::Property {
                key: name.to_owned(),
                kind,
            }
        }
    };
    Ok(column)
}

fn parse_value(raw: &str, kind: ValueKind) -> std::result::Result<Value, String> {
    match kind {
        ValueKind::Str => Ok(Value::Str(raw.to_owned())),
        ValueKind::Int => raw
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("'{raw}' is not an integer")),
        ValueKind::Float => raw
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("'{raw}' is not a number")),
        ValueKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("'{raw}' is not a boolean")),
        },
    }
}

fn open_reader(path: &Path, delimiter: u8) -> Result<(Reader<File>, Vec<Column>)> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)?;
    let columns = reader
        .headers()?
        .iter()
        .map(parse_column)
        .collect::<Result<Vec<_>>>()?;
    Ok((reader, columns))
}

struct RowParser<'a> {
    columns: &'a [Column],
    id_type: IdType,
    path: &'a Path,
}

impl RowParser<'_> {
    fn parse(&self, record: &StringRecord) -> Result<InputEntity> {
        let mut entity = InputEntity::default();
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let bad = |msg: String| {
            ImportError::invalid(format!("{}:{line}: {msg}", self.path.display()))
        };
        for (column, raw) in self.columns.iter().zip(record.iter()) {
            if raw.is_empty() {
                continue;
            }
            match column {
                Column::Id { property, group } => {
                    entity.id = Some(parse_input_id(raw, self.id_type).map_err(bad)?);
                    entity.group = group.clone();
                    if let Some(key) = property {
                        entity.properties.push((key.clone(), Value::Str(raw.to_owned())));
                    }
                }
                Column::Label => entity.labels.extend(
                    raw.split([';', '|'])
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_owned),
                ),
                Column::StartId { group } => {
                    entity.start = Some(parse_input_id(raw, self.id_type).map_err(bad)?);
                    entity.start_group = group.clone();
                }
                Column::EndId { group } => {
                    entity.end = Some(parse_input_id(raw, self.id_type).map_err(bad)?);
                    entity.end_group = group.clone();
                }
                Column::Type => entity.relationship_type = Some(raw.to_owned()),
                Column::Ignore => {}
                Column::Property { key, kind } => {
                    let value = parse_value(raw, *kind).map_err(bad)?;
                    entity.properties.push((key.clone(), value));
                }
            }
        }
        Ok(entity)
    }
}

struct CsvIterator {
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<(Reader<File>, Vec<Column>, PathBuf)>,
    id_type: IdType,
    delimiter: u8,
    record: StringRecord,
}

impl InputIterator for CsvIterator {
    fn next_chunk(&mut self, chunk: &mut InputChunk, max: usize) -> Result<bool> {
        let start = chunk.len();
        while chunk.len() - start < max.max(1) {
            if self.current.is_none() {
                let Some(path) = self.files.get(self.next_file).cloned() else {
                    break;
                };
                self.next_file += 1;
                let (reader, columns) = open_reader(&path, self.delimiter)?;
                debug!(file = %path.display(), columns = columns.len(), "input.csv.open");
                self.current = Some((reader, columns, path));
            }
            let Some((reader, columns, path)) = self.current.as_mut() else {
                break;
            };
            if !reader.read_record(&mut self.record)? {
                self.current = None;
                continue;
            }
            let parser = RowParser {
                columns,
                id_type: self.id_type,
                path,
            };
            chunk.push(parser.parse(&self.record)?);
        }
        Ok(chunk.len() > start)
    }
}

/// Input reading node and relationship CSV files.
pub struct CsvInput {
    node_files: Vec<PathBuf>,
    relationship_files: Vec<PathBuf>,
    id_type: IdType,
    delimiter: u8,
    groups: Groups,
}

impl CsvInput {
    /// Creates an input over the given files, comma separated.
    pub fn new(node_files: Vec<PathBuf>, relationship_files: Vec<PathBuf>, id_type: IdType) -> Self {
        Self {
            node_files,
            relationship_files,
            id_type,
            delimiter: b',',
            groups: Groups::default(),
        }
    }

    /// Uses another field delimiter.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn iterator(&self, files: &[PathBuf]) -> CsvIterator {
        CsvIterator {
            files: files.to_vec(),
            next_file: 0,
            current: None,
            id_type: self.id_type,
            delimiter: self.delimiter,
            record: StringRecord::new(),
        }
    }

    /// Extrapolates rows, properties and labels from a sample of each file.
    fn sample(&self, files: &[PathBuf]) -> Result<SampleTotals> {
        let mut totals = SampleTotals::default();
        for path in files {
            let file_len = fs::metadata(path)?.len();
            let (mut reader, columns) = open_reader(path, self.delimiter)?;
            let header_bytes = reader.position().byte();
            let parser = RowParser {
                columns: &columns,
                id_type: self.id_type,
                path,
            };
            let mut record = StringRecord::new();
            let mut sampled = SampleTotals::default();
            while sampled.rows < SAMPLE_ROWS as u64 && reader.read_record(&mut record)? {
                let entity = parser.parse(&record)?;
                sampled.rows += 1;
                sampled.labels += entity.labels.len() as u64;
                sampled.properties += entity.properties.len() as u64;
                sampled.property_bytes += entity
                    .properties
                    .iter()
                    .map(|(_, v)| super::value_size(v))
                    .sum::<u64>();
            }
            if sampled.rows == 0 {
                continue;
            }
            let sampled_bytes = reader.position().byte().saturating_sub(header_bytes).max(1);
            let rows = ((file_len.saturating_sub(header_bytes)) as f64 / sampled_bytes as f64
                * sampled.rows as f64)
                .round()
                .max(sampled.rows as f64) as u64;
            let scale = rows as f64 / sampled.rows as f64;
            totals.rows += rows;
            totals.labels += (sampled.labels as f64 * scale) as u64;
            totals.properties += (sampled.properties as f64 * scale) as u64;
            totals.property_bytes += (sampled.property_bytes as f64 * scale) as u64;
        }
        Ok(totals)
    }
}

#[derive(Default)]
struct SampleTotals {
    rows: u64,
    labels: u64,
    properties: u64,
    property_bytes: u64,
}

impl Input for CsvInput {
    fn nodes(&self) -> Result<Box<dyn InputIterator + '_>> {
        Ok(Box::new(self.iterator(&self.node_files)))
    }

    fn relationships(&self) -> Result<Box<dyn InputIterator + '_>> {
        Ok(Box::new(self.iterator(&self.relationship_files)))
    }

    fn id_type(&self) -> IdType {
        self.id_type
    }

    fn groups(&self) -> &Groups {
        &self.groups
    }

    fn estimates(&self) -> Result<Estimates> {
        let nodes = self.sample(&self.node_files)?;
        let relationships = self.sample(&self.relationship_files)?;
        Ok(Estimates {
            number_of_nodes: nodes.rows,
            number_of_relationships: relationships.rows,
            number_of_node_properties: nodes.properties,
            number_of_relationship_properties: relationships.properties,
            number_of_node_labels: nodes.labels,
            size_of_node_properties: nodes.property_bytes,
            size_of_relationship_properties: relationships.property_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputId;
    use std::io::Write;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    fn read_all(iter: &mut dyn InputIterator) -> Result<Vec<InputEntity>> {
        let mut out = Vec::new();
        while iter.next_chunk(&mut out, 2)? {}
        Ok(out)
    }

    #[test]
    fn headers_are_parsed() {
        assert_eq!(
            parse_column("personId:ID(people)").unwrap(),
            Column::Id {
                property: Some("personId".into()),
                group: Some("people".into())
            }
        );
        assert_eq!(parse_column(":LABEL").unwrap(), Column::Label);
        assert_eq!(
            parse_column("age:int").unwrap(),
            Column::Property {
                key: "age".into(),
                kind: ValueKind::Int
            }
        );
        assert_eq!(
            parse_column("name").unwrap(),
            Column::Property {
                key: "name".into(),
                kind: ValueKind::Str
            }
        );
        assert!(parse_column("x:blob").is_err());
    }

    #[test]
    fn nodes_and_relationships_are_read() -> Result<()> {
        let dir = tempdir()?;
        let nodes = write(
            dir.path(),
            "nodes.csv",
            ":ID,name,age:int,:LABEL\n1,alice,30,Person;Admin\n2,bob,,Person\n3,carol,41,\n",
        );
        let rels = write(
            dir.path(),
            "rels.csv",
            ":START_ID,:END_ID,:TYPE,since:int\n1,2,KNOWS,2001\n2,3,KNOWS,\n",
        );
        let input = CsvInput::new(vec![nodes], vec![rels], IdType::Integer);
        let nodes = read_all(input.nodes()?.as_mut())?;
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].id, Some(InputId::Int(1)));
        assert_eq!(nodes[0].labels, vec!["Person", "Admin"]);
        assert_eq!(nodes[1].properties, vec![("name".to_owned(), Value::from("bob"))]);
        assert!(nodes[2].labels.is_empty());

        let rels = read_all(input.relationships()?.as_mut())?;
        assert_eq!(rels.len(), 2);
        assert_eq!(rels[0].relationship_type.as_deref(), Some("KNOWS"));
        assert_eq!(rels[0].properties, vec![("since".to_owned(), Value::Int(2001))]);

        let estimates = input.estimates()?;
        assert_eq!(estimates.number_of_nodes, 3);
        assert_eq!(estimates.number_of_relationships, 2);
        Ok(())
    }

    #[test]
    fn bad_integer_is_fatal_with_location() -> Result<()> {
        let dir = tempdir()?;
        let nodes = write(dir.path(), "nodes.csv", ":ID,age:int\n1,old\n");
        let input = CsvInput::new(vec![nodes], vec![], IdType::Integer);
        let err = read_all(input.nodes()?.as_mut()).unwrap_err();
        assert!(matches!(err, ImportError::Invalid(msg) if msg.contains("nodes.csv:2")));
        Ok(())
    }
}
