//! The closed set of mirror slots and where each one is stored.

use serde_json::{json, Value};

use crate::cache::Table;
use crate::CACHE_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
  OfflineInvoices,
  OfflineCustomers,
  OfflinePayments,
  SyncTotals,
  UomCache,
  OffersCache,
  CustomerBalanceCache,
  LocalStockCache,
  StockCacheReady,
  CustomerStorage,
  OpeningStorage,
  OpeningDialogStorage,
  SalesPersons,
  ItemDetailsCache,
  TaxTemplateCache,
  TranslationCache,
  CouponsCache,
  ItemGroupsCache,
  ItemsLastSync,
  CustomersLastSync,
  CacheVersion,
  CacheReady,
  TaxInclusive,
  ManualOffline,
  PrintTemplate,
  TermsAndConditions,
}

impl Slot {
  pub const ALL: [Slot; 26] = [
    Slot::OfflineInvoices,
    Slot::OfflineCustomers,
    Slot::OfflinePayments,
    Slot::SyncTotals,
    Slot::UomCache,
    Slot::OffersCache,
    Slot::CustomerBalanceCache,
    Slot::LocalStockCache,
    Slot::StockCacheReady,
    Slot::CustomerStorage,
    Slot::OpeningStorage,
    Slot::OpeningDialogStorage,
    Slot::SalesPersons,
    Slot::ItemDetailsCache,
    Slot::TaxTemplateCache,
    Slot::TranslationCache,
    Slot::CouponsCache,
    Slot::ItemGroupsCache,
    Slot::ItemsLastSync,
    Slot::CustomersLastSync,
    Slot::CacheVersion,
    Slot::CacheReady,
    Slot::TaxInclusive,
    Slot::ManualOffline,
    Slot::PrintTemplate,
    Slot::TermsAndConditions,
  ];

  /// Storage key, shared with the legacy flat store.
  pub fn key(self) -> &'static str {
    match self {
      Slot::OfflineInvoices => "offline_invoices",
      Slot::OfflineCustomers => "offline_customers",
      Slot::OfflinePayments => "offline_payments",
      Slot::SyncTotals => "pos_last_sync_totals",
      Slot::UomCache => "uom_cache",
      Slot::OffersCache => "offers_cache",
      Slot::CustomerBalanceCache => "customer_balance_cache",
      Slot::LocalStockCache => "local_stock_cache",
      Slot::StockCacheReady => "stock_cache_ready",
      Slot::CustomerStorage => "customer_storage",
      Slot::OpeningStorage => "pos_opening_storage",
      Slot::OpeningDialogStorage => "opening_dialog_storage",
      Slot::SalesPersons => "sales_persons_storage",
      Slot::ItemDetailsCache => "item_details_cache",
      Slot::TaxTemplateCache => "tax_template_cache",
      Slot::TranslationCache => "translation_cache",
      Slot::CouponsCache => "coupons_cache",
      Slot::ItemGroupsCache => "item_groups_cache",
      Slot::ItemsLastSync => "items_last_sync",
      Slot::CustomersLastSync => "customers_last_sync",
      Slot::CacheVersion => "cache_version",
      Slot::CacheReady => "cache_ready",
      Slot::TaxInclusive => "tax_inclusive",
      Slot::ManualOffline => "manual_offline",
      Slot::PrintTemplate => "print_template",
      Slot::TermsAndConditions => "terms_and_conditions",
    }
  }

  pub fn from_key(key: &str) -> Option<Slot> {
    Slot::ALL.into_iter().find(|slot| slot.key() == key)
  }

  pub fn destination(self) -> Table {
    match self {
      Slot::OfflineInvoices | Slot::OfflineCustomers | Slot::OfflinePayments => Table::Queues,
      _ => Table::Kv,
    }
  }

  pub fn default_value(self) -> Value {
    match self {
      Slot::OfflineInvoices
      | Slot::OfflineCustomers
      | Slot::OfflinePayments
      | Slot::OffersCache
      | Slot::CustomerStorage
      | Slot::SalesPersons
      | Slot::ItemGroupsCache => json!([]),
      Slot::SyncTotals => json!({ "pending": 0, "synced": 0, "drafted": 0 }),
      Slot::UomCache
      | Slot::CustomerBalanceCache
      | Slot::LocalStockCache
      | Slot::ItemDetailsCache
      | Slot::TaxTemplateCache
      | Slot::TranslationCache
      | Slot::CouponsCache => json!({}),
      Slot::StockCacheReady | Slot::CacheReady | Slot::TaxInclusive | Slot::ManualOffline => {
        json!(false)
      }
      Slot::OpeningStorage
      | Slot::OpeningDialogStorage
      | Slot::ItemsLastSync
      | Slot::CustomersLastSync => Value::Null,
      Slot::CacheVersion => json!(CACHE_VERSION),
      Slot::PrintTemplate | Slot::TermsAndConditions => json!(""),
    }
  }

  /// Derived caches that eviction may drop without losing unsynced data.
  pub fn is_evictable(self) -> bool {
    matches!(
      self,
      Slot::UomCache
        | Slot::OffersCache
        | Slot::CustomerBalanceCache
        | Slot::LocalStockCache
        | Slot::StockCacheReady
        | Slot::ItemDetailsCache
        | Slot::CouponsCache
        | Slot::ItemGroupsCache
    )
  }
}
