use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tokio::fs;

use crate::{types::Record, utils::split_postal_code_city};

#[derive(Debug, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    kind: &'static str,
    pub features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    pub id: String,
    /// `null` for listings without valid coordinates.
    pub geometry: Option<Geometry>,
    pub properties: FeatureProperties,
}

/// A GeoJSON point, `[longitude, latitude]`.
#[derive(Debug, Serialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    kind: &'static str,
    pub coordinates: [f64; 2],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureProperties {
    pub id: String,
    pub price: Option<u64>,
    pub postal_code: String,
    pub city: String,
    pub street_name: String,
    pub surface: Option<u32>,
    pub land: Option<u32>,
    pub rooms: Option<u32>,
    pub energy_label: Option<String>,
    pub link: String,
    pub elevation: Option<f64>,
}

impl From<&Record> for Feature {
    fn from(record: &Record) -> Self {
        let (postal_code, city) = split_postal_code_city(&record.postal_code_city);
        let geometry = record
            .coordinates
            .filter(|c| c.is_valid())
            .map(|c| Geometry {
                kind: "Point",
                coordinates: [c.longitude, c.latitude],
            });

        Feature {
            kind: "Feature",
            id: record.id.clone(),
            geometry,
            properties: FeatureProperties {
                id: record.id.clone(),
                price: record.price_sale,
                postal_code,
                city,
                street_name: record.street_name.clone(),
                surface: record.living_area,
                land: record.plot_area,
                rooms: record.rooms,
                energy_label: record.energy_label.clone(),
                link: record.link.clone(),
                elevation: record.elevation,
            },
        }
    }
}

impl FeatureCollection {
    /// One feature per record, in the order given.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        FeatureCollection {
            kind: "FeatureCollection",
            features: records.into_iter().map(Feature::from).collect(),
        }
    }

    pub async fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .context(format!("could not create {:?}", dir))?;
        }
        fs::write(path, serde_json::to_vec(self)?)
            .await
            .context(format!("could not write feature collection to {:?}", path))?;
        info!(
            "wrote {} features to {:?}",
            self.features.len(),
            path
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Coordinates;
    use serde_json::json;

    #[test]
    fn maps_records_to_features() {
        let located = Record {
            street_name: "Himalaya 78".into(),
            postal_code_city: "3524 XG Utrecht".into(),
            price_sale: Some(425_000),
            living_area: Some(120),
            plot_area: Some(200),
            rooms: Some(5),
            energy_label: Some("A".into()),
            coordinates: Some(Coordinates::new(52.08, 5.13)),
            elevation: Some(1.5),
            ..Record::new("https://www.funda.nl/koop/a/")
        };
        let fallback = Record {
            coordinates: Some(Coordinates::FALLBACK),
            ..Record::new("https://www.funda.nl/koop/b/")
        };

        let collection = FeatureCollection::from_records(&[located.clone(), fallback]);
        let value = serde_json::to_value(&collection).unwrap();

        assert_eq!(value["type"], "FeatureCollection");
        assert_eq!(value["features"].as_array().unwrap().len(), 2);
        assert_eq!(
            value["features"][0],
            json!({
                "type": "Feature",
                "id": located.id,
                "geometry": { "type": "Point", "coordinates": [5.13, 52.08] },
                "properties": {
                    "id": located.id,
                    "price": 425000,
                    "postalCode": "3524 XG",
                    "city": "Utrecht",
                    "streetName": "Himalaya 78",
                    "surface": 120,
                    "land": 200,
                    "rooms": 5,
                    "energyLabel": "A",
                    "link": "https://www.funda.nl/koop/a/",
                    "elevation": 1.5
                }
            })
        );
        assert!(value["features"][1]["geometry"].is_null());
    }

    #[tokio::test]
    async fn writes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("public").join("features.json");
        FeatureCollection::from_records(&[Record::new("https://www.funda.nl/koop/a/")])
            .write(&path)
            .await
            .unwrap();
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["features"].as_array().unwrap().len(), 1);
    }
}
