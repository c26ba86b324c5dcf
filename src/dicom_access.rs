use dicom::core::Tag;
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{DefaultDicomObject, InMemDicomObject};

/// Small helper trait to pull typed values from different DICOM object shapes.
pub trait ElementAccess {
    fn element_str(&self, tag: Tag) -> Option<String>;
    fn element_u32(&self, tag: Tag) -> Option<u32>;
    fn element_floats(&self, tag: Tag) -> Option<Vec<f64>>;
    fn has_element(&self, tag: Tag) -> bool;
    fn transfer_syntax(&self) -> Option<String>;
}

impl ElementAccess for DefaultDicomObject {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn element_u32(&self, tag: Tag) -> Option<u32> {
        self.element(tag).ok().and_then(|e| e.to_int::<u32>().ok())
    }

    fn element_floats(&self, tag: Tag) -> Option<Vec<f64>> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
            .filter(|values| !values.is_empty())
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }

    fn transfer_syntax(&self) -> Option<String> {
        Some(
            self.meta()
                .transfer_syntax()
                .trim_end_matches('\0')
                .to_string(),
        )
    }
}

impl ElementAccess for InMemDicomObject<StandardDataDictionary> {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn element_u32(&self, tag: Tag) -> Option<u32> {
        self.element(tag).ok().and_then(|e| e.to_int::<u32>().ok())
    }

    fn element_floats(&self, tag: Tag) -> Option<Vec<f64>> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
            .filter(|values| !values.is_empty())
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }

    fn transfer_syntax(&self) -> Option<String> {
        None
    }
}
