use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gdal::vector::{
    field_type_to_name, geometry_type_to_name, FieldValue, LayerAccess, OGRwkbGeometryType,
};
use gdal::{Dataset, DatasetOptions, GdalOpenFlags, Metadata};
use log::{debug, warn};

use crate::errors::EngineError;
use crate::geometry::Envelope;

/// One streamed feature: layer FID for random access, the reported
/// object id (OBJECTID attribute when present, FID otherwise), plain
/// attributes and the converted geometry.
#[derive(Debug, Clone)]
pub struct FeatureRecord {
    pub fid: i64,
    pub oid: i64,
    pub attributes: HashMap<String, AttrValue>,
    pub geometry: Option<geo_types::Geometry<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Real(f64),
    Text(String),
}

fn convert_field(value: FieldValue) -> Option<AttrValue> {
    match value {
        FieldValue::IntegerValue(v) => Some(AttrValue::Int(v as i64)),
        FieldValue::Integer64Value(v) => Some(AttrValue::Int(v)),
        FieldValue::RealValue(v) => Some(AttrValue::Real(v)),
        FieldValue::StringValue(v) => Some(AttrValue::Text(v)),
        _ => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SrsComparison {
    Same,
    Missing,
    Different(String, String),
}

/// Read adapter over one vector store. All reads of a store go through
/// one instance, which keeps the underlying driver single-threaded.
pub struct VectorDataset {
    dataset: Dataset,
    path: PathBuf,
}

impl VectorDataset {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Err(EngineError::StoreOpen(
                path.to_path_buf(),
                "path does not exist".to_owned(),
            ));
        }
        let options = DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_VECTOR,
            ..Default::default()
        };
        let dataset = Dataset::open_ex(path, options)
            .map_err(|error| EngineError::StoreOpen(path.to_path_buf(), format!("{error}")))?;
        Ok(VectorDataset {
            dataset,
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn from_dataset(dataset: Dataset, path: PathBuf) -> Self {
        VectorDataset { dataset, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.dataset.layers().map(|layer| layer.name()).collect()
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.dataset.layer_by_name(name).is_ok()
    }

    pub fn record_count(&self, name: &str) -> Result<i64, EngineError> {
        let layer = self.layer(name)?;
        Ok(layer.feature_count() as i64)
    }

    /// Field name to field type name, FID and geometry columns excluded.
    pub fn table_schema(&self, name: &str) -> Result<HashMap<String, String>, EngineError> {
        let layer = self.layer(name)?;
        Ok(layer
            .defn()
            .fields()
            .map(|field| (field.name(), field_type_to_name(field.field_type())))
            .collect())
    }

    pub fn layer_geometry_type(&self, name: &str) -> Result<String, EngineError> {
        let layer = self.layer(name)?;
        let geometry_type = layer
            .defn()
            .geom_fields()
            .next()
            .map(|field| field.field_type())
            .unwrap_or(OGRwkbGeometryType::wkbNone);
        Ok(geometry_type_to_name(geometry_type).to_uppercase())
    }

    pub fn layer_extent(&self, name: &str) -> Result<Envelope, EngineError> {
        let layer = self.layer(name)?;
        if layer.feature_count() == 0 {
            return Ok(Envelope::EMPTY);
        }
        let extent = layer.get_extent()?;
        Ok(Envelope::new(extent.MinX, extent.MinY, extent.MaxX, extent.MaxY))
    }

    /// Streams the layer in feature order. The visitor returns false to
    /// stop early; a restart means re-opening the layer.
    pub fn read_features<Visit>(&self, name: &str, visit: Visit) -> Result<u64, EngineError>
    where
        Visit: FnMut(FeatureRecord) -> Result<bool, EngineError>,
    {
        let mut layer = self.layer(name)?;
        layer.clear_spatial_filter();
        Self::drain(&mut layer, visit)
    }

    /// Streams only features whose envelope intersects the filter
    /// envelope, through the driver's spatial filter.
    pub fn read_features_in<Visit>(
        &self,
        name: &str,
        envelope: &Envelope,
        visit: Visit,
    ) -> Result<u64, EngineError>
    where
        Visit: FnMut(FeatureRecord) -> Result<bool, EngineError>,
    {
        if envelope.is_empty() {
            return Ok(0);
        }
        let mut layer = self.layer(name)?;
        layer.set_spatial_filter_rect(
            envelope.min_x(),
            envelope.min_y(),
            envelope.max_x(),
            envelope.max_y(),
        );
        let outcome = Self::drain(&mut layer, visit);
        layer.clear_spatial_filter();
        outcome
    }

    fn drain<Visit>(layer: &mut gdal::vector::Layer, mut visit: Visit) -> Result<u64, EngineError>
    where
        Visit: FnMut(FeatureRecord) -> Result<bool, EngineError>,
    {
        let layer_name = layer.name();
        let mut processed = 0;
        for feature in layer.features() {
            processed += 1;
            if !visit(Self::to_record(&layer_name, &feature))? {
                break;
            }
        }
        Ok(processed)
    }

    pub fn feature_by_id(&self, name: &str, fid: i64) -> Result<Option<FeatureRecord>, EngineError> {
        if fid < 0 {
            return Ok(None);
        }
        let layer = self.layer(name)?;
        Ok(layer
            .feature(fid as u64)
            .map(|feature| Self::to_record(name, &feature)))
    }

    fn to_record(layer_name: &str, feature: &gdal::vector::Feature) -> FeatureRecord {
        let fid = feature.fid().map(|fid| fid as i64).unwrap_or(-1);
        let mut attributes = HashMap::new();
        for (name, value) in feature.fields() {
            if let Some(value) = value.and_then(convert_field) {
                let _previous = attributes.insert(name, value);
            }
        }
        let oid = match attributes.get("OBJECTID") {
            Some(AttrValue::Int(v)) => *v,
            _ => fid,
        };
        let geometry = match feature.geometry() {
            Some(geometry) => match geometry.to_geo() {
                Ok(geometry) => Some(geometry),
                Err(error) => {
                    warn!("feature {fid} of '{layer_name}' has an unconvertible geometry: {error}");
                    None
                }
            },
            None => None,
        };
        FeatureRecord {
            fid,
            oid,
            attributes,
            geometry,
        }
    }

    pub fn compare_layer_srs(&self, a: &str, b: &str) -> Result<SrsComparison, EngineError> {
        let srs_a = self.layer(a)?.spatial_ref();
        let srs_b = self.layer(b)?.spatial_ref();
        match (srs_a, srs_b) {
            (Some(srs_a), Some(srs_b)) => {
                let wkt_a = srs_a.to_wkt()?;
                let wkt_b = srs_b.to_wkt()?;
                if wkt_a == wkt_b {
                    Ok(SrsComparison::Same)
                } else {
                    Ok(SrsComparison::Different(
                        srs_a.name().unwrap_or_else(|_| "unknown".to_owned()),
                        srs_b.name().unwrap_or_else(|_| "unknown".to_owned()),
                    ))
                }
            }
            _ => Ok(SrsComparison::Missing),
        }
    }

    pub(crate) fn layer_spatial_ref(
        &self,
        name: &str,
    ) -> Result<Option<gdal::spatial_ref::SpatialRef>, EngineError> {
        Ok(self.layer(name)?.spatial_ref())
    }

    fn layer(&self, name: &str) -> Result<gdal::vector::Layer, EngineError> {
        self.dataset
            .layer_by_name(name)
            .map_err(|_| EngineError::UnknownLayer(name.to_owned()))
    }
}

pub fn create_dataset(path: &Path, driver: Option<String>) -> Result<Dataset, EngineError> {
    let driver_name = match driver {
        Some(name) => name,
        None => {
            let extension = path
                .extension()
                .and_then(|extension| extension.to_str())
                .ok_or_else(|| {
                    EngineError::InputInvalid(format!(
                        "output path {path:?} has no extension to infer a driver from"
                    ))
                })?;
            let (name, capability) = GdalDrivers.infer_driver_name(extension).ok_or_else(|| {
                EngineError::InputInvalid(format!(
                    "no GDAL driver handles the '.{extension}' extension"
                ))
            })?;
            if !capability.writable {
                return Err(EngineError::InputInvalid(format!(
                    "driver {name} cannot create datasets"
                )));
            }
            name
        }
    };
    debug!("creating error store {path:?} with driver {driver_name}");
    let driver = gdal::DriverManager::get_driver_by_name(&driver_name)?;
    Ok(driver.create_vector_only(path)?)
}

pub struct GdalDrivers;

/// What one vector driver can do and the file suffixes it claims.
#[derive(Debug, Clone)]
pub struct DriverCapability {
    pub readable: bool,
    pub writable: bool,
    pub extensions: String,
}

impl GdalDrivers {
    /// Whether the file suffix can be mapped to a vector driver.
    pub fn infer_driver_name(&self, extension: &str) -> Option<(String, DriverCapability)> {
        self.driver_map().into_iter().find(|(_, capability)| {
            capability
                .extensions
                .split_whitespace()
                .any(|candidate| candidate == extension)
        })
    }

    fn driver_map(&self) -> HashMap<String, DriverCapability> {
        let mut drivers = HashMap::new();
        for i in 0..gdal::DriverManager::count() {
            let Ok(driver) = gdal::DriverManager::get_driver(i) else {
                continue;
            };
            if driver.metadata_item("DCAP_VECTOR", "").is_none()
                || driver.short_name().is_empty()
            {
                continue;
            }
            // The multi-extension metadata key wins when both are set.
            let extensions = driver
                .metadata_item("DMD_EXTENSIONS", "")
                .filter(|extensions| !extensions.is_empty())
                .or_else(|| driver.metadata_item("DMD_EXTENSION", ""))
                .unwrap_or_default();
            if extensions.is_empty() {
                continue;
            }
            let _previous = drivers.insert(
                driver.short_name(),
                DriverCapability {
                    readable: driver.metadata_item("DCAP_OPEN", "").is_some(),
                    writable: driver.metadata_item("DCAP_CREATE", "").is_some(),
                    extensions,
                },
            );
        }
        drivers
    }

    /// Driver name to extension list, narrowed to the requested
    /// capabilities.
    pub fn capability(&self, want_read: bool, want_write: bool) -> HashMap<String, String> {
        self.driver_map()
            .into_iter()
            .filter(|(_, capability)| {
                (!want_read || capability.readable) && (!want_write || capability.writable)
            })
            .map(|(name, capability)| (name, capability.extensions))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use gdal::vector::{LayerOptions, ToGdal};
    use geo::{point, polygon};

    /// In-memory store with one point layer and one polygon layer.
    pub(crate) fn sample_dataset() -> VectorDataset {
        let driver = gdal::DriverManager::get_driver_by_name("Memory").expect("memory driver");
        let mut dataset = driver.create_vector_only("qc-test").expect("dataset");
        {
            let mut points = dataset
                .create_layer(LayerOptions {
                    name: "points",
                    ty: OGRwkbGeometryType::wkbPoint,
                    ..Default::default()
                })
                .expect("points layer");
            for (x, y) in [(1.0, 1.0), (100.0, 100.0)] {
                points
                    .create_feature(point! {x: x, y: y}.to_gdal().expect("gdal point"))
                    .expect("create feature");
            }
        }
        {
            let mut polygons = dataset
                .create_layer(LayerOptions {
                    name: "zones",
                    ty: OGRwkbGeometryType::wkbPolygon,
                    ..Default::default()
                })
                .expect("zones layer");
            let zone = polygon![
                (x: 0.0, y: 0.0),
                (x: 10.0, y: 0.0),
                (x: 10.0, y: 10.0),
                (x: 0.0, y: 10.0),
                (x: 0.0, y: 0.0)
            ];
            polygons
                .create_feature(zone.to_gdal().expect("gdal polygon"))
                .expect("create feature");
        }
        VectorDataset::from_dataset(dataset, PathBuf::from("qc-test"))
    }

    #[test]
    fn reports_layer_presence_and_counts() {
        let dataset = sample_dataset();
        assert!(dataset.table_exists("points"));
        assert!(!dataset.table_exists("missing"));
        assert_eq!(dataset.record_count("points").unwrap(), 2);
        assert_eq!(dataset.record_count("zones").unwrap(), 1);
        assert!(matches!(
            dataset.record_count("missing"),
            Err(EngineError::UnknownLayer(_))
        ));
    }

    #[test]
    fn extent_covers_all_features() {
        let dataset = sample_dataset();
        let extent = dataset.layer_extent("points").unwrap();
        assert!(extent.contains_xy(1.0, 1.0));
        assert!(extent.contains_xy(100.0, 100.0));
    }

    #[test]
    fn visitor_can_stop_the_stream() {
        let dataset = sample_dataset();
        let mut seen = 0;
        let processed = dataset
            .read_features("points", |_| {
                seen += 1;
                Ok(false)
            })
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(processed, 1);
    }

    #[test]
    fn spatial_filter_narrows_the_stream() {
        let dataset = sample_dataset();
        let mut seen = Vec::new();
        let _count = dataset
            .read_features_in("points", &Envelope::new(0.0, 0.0, 10.0, 10.0), |record| {
                seen.push(record.geometry.expect("geometry"));
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn features_come_back_with_geometry() {
        let dataset = sample_dataset();
        let mut fids = Vec::new();
        let _count = dataset
            .read_features("zones", |record| {
                assert!(record.geometry.is_some());
                fids.push(record.fid);
                Ok(true)
            })
            .unwrap();
        assert_eq!(fids.len(), 1);
        let by_id = dataset.feature_by_id("zones", fids[0]).unwrap();
        assert!(by_id.is_some());
    }
}
