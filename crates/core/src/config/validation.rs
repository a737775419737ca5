use crate::{QueueError, QueueResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> QueueResult<()>;
}

pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field_name: &str) -> QueueResult<()> {
        if value.trim().is_empty() {
            return Err(QueueError::config_error(format!("{field_name} 不能为空")));
        }
        Ok(())
    }

    pub fn validate_positive(value: u64, field_name: &str) -> QueueResult<()> {
        if value == 0 {
            return Err(QueueError::config_error(format!("{field_name} 必须大于 0")));
        }
        Ok(())
    }

    pub fn validate_range(value: f64, min: f64, max: f64, field_name: &str) -> QueueResult<()> {
        if !value.is_finite() || value < min || value > max {
            return Err(QueueError::config_error(format!(
                "{field_name} 必须在 {min} 到 {max} 之间, 实际为 {value}"
            )));
        }
        Ok(())
    }

    pub fn validate_one_of(value: &str, allowed: &[&str], field_name: &str) -> QueueResult<()> {
        if !allowed.contains(&value) {
            return Err(QueueError::config_error(format!(
                "{field_name} 必须是 {allowed:?} 之一, 实际为 '{value}'"
            )));
        }
        Ok(())
    }

    pub fn validate_ordered(lower: u64, upper: u64, lower_name: &str, upper_name: &str) -> QueueResult<()> {
        if lower > upper {
            return Err(QueueError::config_error(format!(
                "{lower_name} 不能大于 {upper_name}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_utils() {
        assert!(ValidationUtils::validate_not_empty("x", "f").is_ok());
        assert!(ValidationUtils::validate_not_empty(" ", "f").is_err());
        assert!(ValidationUtils::validate_positive(0, "f").is_err());
        assert!(ValidationUtils::validate_range(0.5, 0.0, 1.0, "f").is_ok());
        assert!(ValidationUtils::validate_range(f64::NAN, 0.0, 1.0, "f").is_err());
        assert!(ValidationUtils::validate_one_of("json", &["json", "pretty"], "f").is_ok());
        assert!(ValidationUtils::validate_one_of("xml", &["json", "pretty"], "f").is_err());
        assert!(ValidationUtils::validate_ordered(2, 1, "a", "b").is_err());
    }
}
