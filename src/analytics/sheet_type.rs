use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetType {
    Orders,
    OrderItems,
    Customers,
    Products,
}

impl SheetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SheetType::Orders => "orders",
            SheetType::OrderItems => "order_items",
            SheetType::Customers => "customers",
            SheetType::Products => "products",
        }
    }
}

impl fmt::Display for SheetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sheet type from the tab name (case-insensitive, exact); unknown names are orders
pub fn detect_sheet_type(sheet_name: &str) -> SheetType {
    match sheet_name.trim().to_lowercase().as_str() {
        "order_items" => SheetType::OrderItems,
        "customers" => SheetType::Customers,
        "products" => SheetType::Products,
        _ => SheetType::Orders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_sheet_type() {
        assert_eq!(detect_sheet_type("Orders"), SheetType::Orders);
        assert_eq!(detect_sheet_type("  ORDER_ITEMS "), SheetType::OrderItems);
        assert_eq!(detect_sheet_type("customers"), SheetType::Customers);
        assert_eq!(detect_sheet_type("Products"), SheetType::Products);
        assert_eq!(detect_sheet_type("Sheet1"), SheetType::Orders);
        assert_eq!(detect_sheet_type("order items"), SheetType::Orders);
    }
}
